//! SOCKS forwarder driver boundary (C11). Invocation of the external
//! `danted` binary, and rendering its config from the `${SOCKS_PORT}`
//! template, is external to the core per spec — this module defines the
//! trait the supervisor drives and the template substitution helper.

use async_trait::async_trait;

/// Substitute `${SOCKS_PORT}` in a danted config template.
pub fn render_danted_config(template: &str, socks_port: u16) -> String {
    template.replace("${SOCKS_PORT}", &socks_port.to_string())
}

#[async_trait]
pub trait SocksDriver: Send + Sync {
    /// Start the SOCKS process if not already running. Idempotent.
    async fn start(&self);
    /// Stop the SOCKS process. Idempotent.
    async fn stop(&self);
    /// True if the process is still alive.
    async fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_socks_port() {
        let template = "port = ${SOCKS_PORT}\n";
        assert_eq!(render_danted_config(template, 1080), "port = 1080\n");
    }

    #[test]
    fn leaves_other_text_untouched() {
        let template = "user.notprivileged: nobody\nport = ${SOCKS_PORT}\n";
        let rendered = render_danted_config(template, 9050);
        assert!(rendered.contains("user.notprivileged: nobody"));
        assert!(rendered.contains("port = 9050"));
    }
}
