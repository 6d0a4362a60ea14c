use std::time::Duration;

use ahash::AHashMap;
use sy_core::config::{AgentConfig, CONTROL_WORDS};
use sy_core::types::AgentKind;

use crate::error::{AgentError, Result};

/// Where a keyword sends its line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRoute {
    pub keyword: String,
    pub kind: AgentKind,
    pub display_name: String,
    pub default_prompt: Option<String>,
    pub timeout: Duration,
}

impl AgentRoute {
    /// The prompt to send for `argument`, falling back to the default prompt
    /// when the argument is empty.
    pub fn prompt_for<'a>(&'a self, argument: &'a str) -> &'a str {
        match (argument.is_empty(), self.default_prompt.as_deref()) {
            (true, Some(default)) => default,
            _ => argument,
        }
    }
}

/// Keyword -> agent mapping, validated once at startup.
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    routes: AHashMap<String, AgentRoute>,
}

impl KeywordTable {
    pub fn from_configs(agents: &[AgentConfig]) -> Result<Self> {
        let mut table = Self::default();
        for agent in agents {
            table.insert(AgentRoute {
                keyword: agent.keyword.clone(),
                kind: AgentKind::new(agent.kind.clone()),
                display_name: agent.display_name().to_string(),
                default_prompt: agent.default_prompt.clone(),
                timeout: agent.timeout(),
            })?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, route: AgentRoute) -> Result<()> {
        let kw = route.keyword.as_str();
        if kw.is_empty() || kw.chars().any(char::is_whitespace) {
            return Err(AgentError::Config(format!(
                "keyword '{kw}' must be a single non-empty token"
            )));
        }
        if CONTROL_WORDS.contains(&kw) {
            return Err(AgentError::Config(format!(
                "keyword '{kw}' is reserved as a control word"
            )));
        }
        if self.routes.contains_key(kw) {
            return Err(AgentError::Config(format!("duplicate keyword '{kw}'")));
        }
        self.routes.insert(route.keyword.clone(), route);
        Ok(())
    }

    pub fn lookup(&self, keyword: &str) -> Option<&AgentRoute> {
        self.routes.get(keyword)
    }

    /// Split `line` into its agent route and argument if the first token is a
    /// registered keyword. The argument is the trimmed remainder, possibly
    /// empty.
    pub fn classify<'a>(&self, line: &'a str) -> Option<(&AgentRoute, &'a str)> {
        let line = line.trim();
        let (first, rest) = match line.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, rest.trim()),
            None => (line, ""),
        };
        self.lookup(first).map(|route| (route, rest))
    }

    pub fn keywords(&self) -> Vec<&str> {
        let mut kws: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        kws.sort_unstable();
        kws
    }

    pub fn routes(&self) -> impl Iterator<Item = &AgentRoute> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
