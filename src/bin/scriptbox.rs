use anyhow::Result;

fn main() -> Result<()> {
    scriptbox::cli::run()
}
