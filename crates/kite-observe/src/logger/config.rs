use std::io::IsTerminal;

use crate::logger::format::LoggerFormat;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directive, e.g. `"info"` or `"info,kite.stream=debug"`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl LoggerConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LoggerFormat) -> Self {
        self.format = format;
        if format != LoggerFormat::Text {
            self.use_color = false;
        }
        self
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        // Agent logs go to stderr; stdout may carry job passthrough.
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stderr().is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_text_formats_drop_color() {
        let cfg = LoggerConfig {
            use_color: true,
            ..Default::default()
        }
        .with_format(LoggerFormat::Json)
        .with_level("debug");
        assert!(!cfg.use_color);
        assert_eq!(cfg.level, "debug");
    }
}
