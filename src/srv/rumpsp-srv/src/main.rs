use rumpsp_srv::{init_logging_from_env, RumpServer, ServerConfig};
use tracing::info;

fn main() -> miette::Result<()> {
    init_logging_from_env();

    let config = ServerConfig::from_env()?;
    let server = RumpServer::bind(config)?;
    info!("rump kernel listening on {}", server.local_addr());
    server.serve()?;
    Ok(())
}
