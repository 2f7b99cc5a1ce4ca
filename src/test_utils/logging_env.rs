use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn prepare_test_env() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_missing| EnvFilter::new("aviationwx_bridge=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();

    let _ = color_eyre::install();
}
