fn main() -> anyhow::Result<()> {
    fcnseg_core::run()
}
