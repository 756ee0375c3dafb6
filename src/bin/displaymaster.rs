fn main() -> anyhow::Result<()> {
    displaymaster::dm::main()
}
