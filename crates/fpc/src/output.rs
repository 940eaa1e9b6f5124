//! Colored terminal output.
//!
//! Status messages go to stderr. Fields describing cache state (`key`,
//! `backlog show`) go to stdout so they can be piped.

use console::{Style, Term};

pub(crate) struct Output {
    messages: Term,
    data: Term,
    ok: Style,
    warn: Style,
    fail: Style,
    heading: Style,
    label: Style,
}

impl Output {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            messages: Term::stderr(),
            data: Term::stdout(),
            ok: Style::new().green(),
            warn: Style::new().yellow(),
            fail: Style::new().red().bold(),
            heading: Style::new().cyan().bold(),
            label: Style::new().dim(),
        }
    }

    pub(crate) fn info(&self, msg: &str) {
        let _ = self.data.write_line(msg);
    }

    pub(crate) fn success(&self, msg: &str) {
        self.message(&self.ok, msg);
    }

    pub(crate) fn warning(&self, msg: &str) {
        self.message(&self.warn, msg);
    }

    pub(crate) fn error(&self, msg: &str) {
        self.message(&self.fail, msg);
    }

    /// Section title above a list of fields.
    pub(crate) fn highlight(&self, msg: &str) {
        let _ = self.data.write_line(&self.heading.apply_to(msg).to_string());
    }

    /// `name value` with the name dimmed and padded to `width`.
    pub(crate) fn field(&self, name: &str, value: &str, width: usize) {
        let name = format!("{name:<width$}");
        let _ = self
            .data
            .write_line(&format!("{} {value}", self.label.apply_to(name)));
    }

    fn message(&self, style: &Style, msg: &str) {
        let _ = self.messages.write_line(&style.apply_to(msg).to_string());
    }
}
