fn main() -> anyhow::Result<()> {
    letters::cli::run()
}
