use anyhow::Result;

fn main() -> Result<()> {
    polyrun::cli::run()
}
