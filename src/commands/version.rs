pub fn run() -> anyhow::Result<()> {
    println!("a1-mediator {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
