#[tokio::main]
async fn main() {
    if let Err(err) = lifelog_sync_lib::run().await {
        log::error!("lifelog-sync exited with error: {err:#}");
        eprintln!("lifelog-sync: {err:#}");
        std::process::exit(1);
    }
}
