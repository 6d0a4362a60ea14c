/// Turns input deltas into complete lines.
///
/// Lines end at `\n`, `\r\n` or a lone `\r`. A `\r\n` split across two
/// deltas still counts as one terminator.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: String,
    after_cr: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta and take every line it completes, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in delta.chars() {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match ch {
                '\n' if after_cr => {}
                '\n' => lines.push(std::mem::take(&mut self.buf)),
                '\r' => {
                    lines.push(std::mem::take(&mut self.buf));
                    self.after_cr = true;
                }
                _ => self.buf.push(ch),
            }
        }
        lines
    }

    /// Text received since the last terminator.
    pub fn partial(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
