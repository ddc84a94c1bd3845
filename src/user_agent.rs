//! User-Agent string shared by the RPC and archive HTTP clients.

const PROJECT_UA_URL: &str = "https://github.com/fierce/offline-prefetch";

/// User-Agent identifying this tool on every request.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("offline-prefetch/{version} (+{PROJECT_UA_URL})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_names_tool_and_version() {
        let ua = default_user_agent();
        assert!(ua.starts_with("offline-prefetch/"));
        assert!(ua.contains(env!("CARGO_PKG_VERSION")));
        assert!(ua.contains(PROJECT_UA_URL));
    }
}
