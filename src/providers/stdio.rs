//! Line-delimited JSON-RPC over stdin/stdout for a self-hosted provider.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::registry::{handle_message, ProviderRegistry};

/// Serve `registry` on the process's stdin/stdout until stdin closes.
///
/// Stdout carries protocol traffic only; logging must go elsewhere.
pub async fn serve_stdio(registry: ProviderRegistry) -> std::io::Result<()> {
    tracing::info!(provider = %registry.name(), "serving over stdio");
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve_lines(&registry, stdin, stdout).await
}

/// Answer each request line on `reader` with one response line on `writer`.
pub async fn serve_lines<R, W>(
    registry: &ProviderRegistry,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_message(registry, line) {
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    tracing::info!(provider = %registry.name(), "stdin closed, stopping");
    Ok(())
}
