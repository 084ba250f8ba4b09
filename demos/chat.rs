//! Verify an enclave, then chat through the pinned connection
//!
//! ```text
//! TINFOIL_API_KEY=... RUST_LOG=tinfoil_client=debug cargo run --example chat -- "Hello"
//! ```

use tinfoil_client::{ChatMessage, ChatRequest, Client, Config, StreamEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What happened in confidential computing this week?".to_string());
    let config = Config::from_env()?;

    println!("Enclave: {}", config.enclave);
    println!("Repo:    {}\n", config.repo);

    println!("→ Verifying code provenance and hardware attestation...");
    let client = Client::new(config).await?;
    let ground_truth = client.ground_truth();
    println!("   ✓ Release digest:  {}", ground_truth.digest());
    println!("   ✓ Measurement:     {}", ground_truth.measurement());
    println!("   ✓ Pinned TLS key:  {}", ground_truth.cert_fingerprint_hex());

    println!("\n→ Streaming completion...\n");
    let request = ChatRequest::new(
        tinfoil_client::client::DEFAULT_CHAT_MODEL,
        vec![ChatMessage::user(prompt)],
    );
    let mut stream = client.chat_stream(&request).await?;

    while let Some(event) = stream.next_event().await? {
        match event {
            StreamEvent::WebSearchCall(call) => {
                let query = call.action.map(|a| a.query).unwrap_or_default();
                println!("   [search {:?}] {}", call.status, query);
            }
            StreamEvent::Chunk(chunk) => {
                for choice in chunk.choices {
                    let Some(delta) = choice.delta else { continue };
                    for annotation in &delta.annotations {
                        println!("   [cite] {} <{}>", annotation.url_citation.title, annotation.url_citation.url);
                    }
                    if let Some(content) = delta.content {
                        print!("{}", content);
                    }
                }
            }
        }
    }
    println!();

    Ok(())
}
