use {
    clap::Parser,
    kv9p::{io_err, res, srv::srv_async},
    kvfs::{
        fs::KvFs,
        store::{DirStore, Store, StoreFlags},
    },
    log::info,
    std::{path::PathBuf, sync::Arc},
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port or host[:port]
    /// where: proto = tcp | unix
    address: String,

    /// Directory holding the database
    storedir: PathBuf,

    /// Name of the database inside the store directory
    #[arg(long, default_value = "kvfs")]
    name: String,

    /// Create the database if it does not exist
    #[arg(long)]
    create: bool,

    /// Sync every stored value to disk
    #[arg(long)]
    sync: bool,
}

async fn kvfs_main(
    Cli {
        address,
        storedir,
        name,
        create,
        sync,
    }: Cli,
) -> kv9p::Result<i32> {
    if !create && !tokio::fs::try_exists(&storedir).await? {
        return res!(io_err!(NotFound, "store directory does not exist, use --create"));
    }

    let mut flags = StoreFlags::empty();
    flags.set(StoreFlags::CREATE, create);
    flags.set(StoreFlags::SYNC, sync);

    let store = Arc::new(DirStore::open(&storedir, &name, flags).await?);
    info!("serving {:?}", store.root());

    println!("[*] Ready to accept clients: {}", address);
    let served = srv_async(KvFs::new(store.clone()), &address).await;
    store.close().await?;

    served.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = kvfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
