fn main() -> anyhow::Result<()> {
    nativestore_cli::run()
}
