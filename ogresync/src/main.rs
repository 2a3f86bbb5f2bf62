use anyhow::Result;
use ogresync::cli;

// Main entry point
fn main() -> Result<()> {
    cli::handle_calls()
}
