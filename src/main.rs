#[tokio::main]
async fn main() {
    if let Err(e) = tabkeep_lib::run().await {
        log::error!("Tabkeep failed: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
