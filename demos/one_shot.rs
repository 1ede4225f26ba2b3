//! Starts the reference server on a local port and runs one exchange against it.

use jrpc::{Client, Envelope, FixedReply, Outcome, Result, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let server = Server::new(FixedReply::default())
        .tcp("127.0.0.1:0")
        .await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());

    let envelope = Envelope::build("add", "1 2", "int int")?;
    println!("{}", String::from_utf8_lossy(&envelope.encode()?));

    match Client::new(addr.into()).execute(envelope).await {
        Outcome::Reply(payload) => println!("Received: {}", String::from_utf8_lossy(&payload)),
        Outcome::Disconnected => println!("Client: disconnected from server"),
        Outcome::TransportError(e) => println!("Transport error: {}", e),
    }
    Ok(())
}
