use taba::cli::CliHandler;

#[tokio::main]
async fn main() {
    let handler = CliHandler::new();

    if let Err(e) = handler.run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
