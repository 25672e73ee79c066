use anyhow::Result;

fn main() -> Result<()> {
    let status = procwarden::cli::run()?;
    std::process::exit(status);
}
