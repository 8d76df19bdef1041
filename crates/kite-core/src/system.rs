use std::sync::OnceLock;

static AGENT_NAME: OnceLock<String> = OnceLock::new();

/// Get platform (OS family).
#[inline]
pub fn platform() -> &'static str {
    std::env::consts::OS
}

/// Get architecture.
#[inline]
pub fn arch() -> &'static str {
    std::env::consts::ARCH
}

/// Default agent name: the host name, or `"kite-agent"` when unavailable.
pub fn agent_name() -> &'static str {
    AGENT_NAME.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(str::to_string))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "kite-agent".to_string())
    })
}

/// `User-Agent` value sent to the control plane.
pub fn user_agent() -> String {
    format!(
        "kite-agent/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        platform(),
        arch()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_stable() {
        let a = agent_name();
        let b = agent_name();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn user_agent_mentions_platform() {
        let ua = user_agent();
        assert!(ua.starts_with("kite-agent/"));
        assert!(ua.contains(platform()));
        assert!(ua.contains(arch()));
    }
}
