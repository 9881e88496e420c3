//! `tracing-subscriber` init, same shape as `rust-dns-dhcp/src/main.rs`.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,brm=debug,brm_agent=debug".parse().unwrap()),
        )
        .init();
}
