use anyhow::Result;

pub fn run() -> Result<()> {
    println!("burrow {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
