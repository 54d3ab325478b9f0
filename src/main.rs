fn main() -> anyhow::Result<()> {
    if let Err(e) = tidepool::run() {
        eprintln!("error[{}]: {}", e.reason_code(), e);
        std::process::exit(1);
    }
    Ok(())
}
