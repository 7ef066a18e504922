fn main() -> anyhow::Result<()> {
    pos_sync_lib::run()
}
