//! Helpers shared by unit and integration tests.

const SKIP_HTTPMOCK_ENV: &str = "RELAY_ADMISSION_SKIP_HTTPMOCK";

/// Tests that stand up an `httpmock` server return early when this is true:
/// either the opt-out variable is set or the sandbox refuses loopback binds.
pub fn should_skip_httpmock() -> bool {
    if std::env::var_os(SKIP_HTTPMOCK_ENV).is_some_and(|value| value != "0") {
        eprintln!("skipping httpmock test: {SKIP_HTTPMOCK_ENV} is set");
        return true;
    }
    match can_bind_localhost() {
        Ok(()) => false,
        Err(err) => {
            eprintln!("skipping httpmock test: cannot bind 127.0.0.1 ({err})");
            true
        }
    }
}

fn can_bind_localhost() -> std::io::Result<()> {
    std::net::TcpListener::bind(("127.0.0.1", 0)).map(drop)
}
