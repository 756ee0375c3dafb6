fn main() -> anyhow::Result<()> {
    displaymaster::dm::dmctl_cli::run()
}
