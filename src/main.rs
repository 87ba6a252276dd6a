#[tokio::main]
async fn main() {
    if let Err(e) = chat_process_manager::run().await {
        eprintln!("chat-process-manager: {}", e);
        std::process::exit(1);
    }
}
