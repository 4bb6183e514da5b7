// gattstack-cli — exercise the stack core against the in-process
// loopback engine. No hardware required.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gattstack_core::runtime::{LoopbackDriver, RunLoop, StackDriver};
use gattstack_core::service::StackService;
use gattstack_core::{
    Blaster, ConnectionController, ConnectionError, DataSinkDataSource, ErrorCategory,
    KeyResolverRegistry, LinkResolver, NetworkLink, Node, NodeKey, PeerDescriptor,
    PhysicalConnection, StackBuilder, StackConfig, StackDescriptor,
};

#[derive(Parser)]
#[command(name = "gattstack")]
#[command(about = "GattStack — BLE network stack playground", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a stack through create / start / mtu / close
    Lifecycle {
        /// Layer composition: G, SNG or DSNG
        #[arg(short, long, default_value = "DSNG")]
        descriptor: String,
        /// PSK identity the engine offers during the handshake
        #[arg(short, long, default_value = "hello")]
        identity: String,
        /// Transport MTU to apply after start
        #[arg(short, long, default_value = "185")]
        mtu: u32,
    },
    /// Blast counted packets between two stacks over a shared link
    Blast {
        /// Number of packets to send
        #[arg(short, long, default_value = "16")]
        count: u32,
    },
    /// Connect, disconnect and reconnect a node
    Reconnect,
    /// Resolve a PSK identity against the default key chain
    Resolve {
        /// Identity to look up (e.g. hello, BOOTSTRAP)
        identity: String,
    },
    /// Explain a stack result code
    Explain {
        /// Result code, e.g. -10601
        code: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Lifecycle {
            descriptor,
            identity,
            mtu,
        } => cmd_lifecycle(&descriptor, &identity, mtu),
        Commands::Blast { count } => cmd_blast(count),
        Commands::Reconnect => cmd_reconnect().await,
        Commands::Resolve { identity } => cmd_resolve(&identity),
        Commands::Explain { code } => cmd_explain(code),
    }
}

fn config_for(descriptor: &str) -> Result<StackConfig> {
    let descriptor: StackDescriptor = descriptor.parse()?;
    Ok(StackConfig::new(descriptor))
}

fn cmd_lifecycle(descriptor: &str, identity: &str, mtu: u32) -> Result<()> {
    let driver = Arc::new(LoopbackDriver::with_psk_identity(
        identity.as_bytes().to_vec(),
    ));
    let (transport, _remote) = driver.create_port_pair();

    let stack = StackBuilder::new(
        Arc::clone(&driver) as Arc<dyn StackDriver>,
        Arc::new(RunLoop::new("cli")),
        NodeKey::new("hello"),
        config_for(descriptor)?,
        Arc::new(KeyResolverRegistry::with_defaults()),
    )
    .build(&transport)?;

    let mut events = stack.events();
    stack.start();

    let status = stack.dtls_status().borrow().clone();
    println!("dtls state:    {:?}", status.state);
    println!("last error:    {}", status.last_error);
    println!("psk identity:  {:?}", status.psk_identity);
    while let Ok(event) = events.try_recv() {
        println!("stack event:   {event}");
    }

    println!("mtu applied:   {}", stack.update_mtu(mtu));
    match stack.top_port() {
        Ok(port) => println!("top port:      {} / {}", port.sink_ref(), port.source_ref()),
        Err(err) => println!("top port:      unavailable ({err})"),
    }

    stack.close();
    println!("closed, active stacks: {}", driver.active_stacks());
    Ok(())
}

fn cmd_blast(count: u32) -> Result<()> {
    let driver = Arc::new(LoopbackDriver::new());
    let (left_transport, right_transport) = driver.create_port_pair();

    let builder = StackBuilder::new(
        Arc::clone(&driver) as Arc<dyn StackDriver>,
        Arc::new(RunLoop::new("cli")),
        NodeKey::new("hello"),
        StackConfig::dtls_socket_netif_gattlink(),
        Arc::new(KeyResolverRegistry::with_defaults()),
    );
    let left = builder.build(&left_transport)?;
    let right = builder.build(&right_transport)?;
    left.start();
    right.start();

    let sender = Blaster::new(Arc::clone(&driver) as Arc<dyn StackDriver>);
    sender.attach(&left.top_port()?)?;
    let receiver = Blaster::new(Arc::clone(&driver) as Arc<dyn StackDriver>);
    receiver.attach(&right.top_port()?)?;

    sender.blast(count)?;
    println!("sent:     {}", sender.sent_count());
    println!("received: {}", receiver.received_count());

    sender.detach();
    receiver.detach();
    Ok(())
}

/// Resolver that mints a fresh loopback link per connection.
struct DemoResolver {
    driver: Arc<LoopbackDriver>,
    next_connection_id: AtomicU64,
}

#[async_trait]
impl LinkResolver for DemoResolver {
    async fn connect(
        &self,
        descriptor: &PeerDescriptor,
    ) -> Result<PhysicalConnection, ConnectionError> {
        Ok(PhysicalConnection {
            descriptor: descriptor.clone(),
            connection_id: self.next_connection_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn negotiate(
        &self,
        _connection: &PhysicalConnection,
    ) -> Result<NetworkLink, ConnectionError> {
        let (local, _remote) = self.driver.create_port_pair();
        Ok(NetworkLink {
            mtu: 185,
            sink: local.sink_ref(),
            source: local.source_ref(),
        })
    }

    async fn disconnect(&self, _connection: &PhysicalConnection) {}
}

async fn cmd_reconnect() -> Result<()> {
    let driver = Arc::new(LoopbackDriver::new());
    let resolver = Arc::new(DemoResolver {
        driver: Arc::clone(&driver),
        next_connection_id: AtomicU64::new(1),
    });
    let controller = Arc::new(ConnectionController::new(
        resolver as Arc<dyn LinkResolver>,
    ));
    controller.update(PeerDescriptor::new("demo-peripheral"));

    let builder = StackBuilder::new(
        Arc::clone(&driver) as Arc<dyn StackDriver>,
        Arc::new(RunLoop::new("cli")),
        NodeKey::new("hello"),
        StackConfig::dtls_socket_netif_gattlink(),
        Arc::new(KeyResolverRegistry::with_defaults()),
    );
    let node = Node::new(NodeKey::new("hello"), controller, builder);

    let connection = node.connect().await?;
    println!(
        "connected: mtu {} state {:?}",
        connection.link.mtu,
        connection.stack.dtls_status().borrow().state
    );

    node.disconnect().await;
    println!(
        "disconnected, active stacks: {}",
        driver.active_stacks()
    );

    let connection = node.connect().await?;
    println!(
        "reconnected: mtu {} state {:?}",
        connection.link.mtu,
        connection.stack.dtls_status().borrow().state
    );
    Ok(())
}

fn cmd_resolve(identity: &str) -> Result<()> {
    let registry = KeyResolverRegistry::with_defaults();
    match registry.resolve(&NodeKey::new("hello"), identity.as_bytes()) {
        Some(key) => println!("{}", hex::encode(key)),
        None => println!("no resolver knows {identity:?}"),
    }
    Ok(())
}

fn cmd_explain(code: i32) -> Result<()> {
    let category = ErrorCategory::from_code(code);
    println!("{code}: {}", category.title());
    Ok(())
}
