use std::net::{Ipv4Addr, Ipv6Addr};

use crab_pinhole::{
    net::{Ipv4Config, Ipv6Config},
    ClientConfig, Family, NetworkInterface, PcpClient, Reactor, RECOMMENDED_MAPPING_LIFETIME_SECONDS,
};

#[derive(clap::Parser)]
struct Cli {
    /// This host's IPv4 address on the interface facing the router.
    #[arg(short, long)]
    address: Ipv4Addr,

    /// The IPv4 router to request mappings from.
    #[arg(short, long)]
    gateway: Ipv4Addr,

    /// Also map over IPv6 from this link-local address.
    #[arg(long, requires_all = ["gateway6", "scope_id"])]
    link_local: Option<Ipv6Addr>,

    /// The IPv6 router, usually its link-local address.
    #[arg(long)]
    gateway6: Option<Ipv6Addr>,

    /// Index of the interface the link-local addresses belong to.
    #[arg(long)]
    scope_id: Option<u32>,

    #[arg(short = 'p', long, default_value_t = 8080)]
    internal_port: u16,

    #[arg(short = 'e', long)]
    external_port: Option<u16>,

    #[arg(short, long, default_value_t = false)]
    udp: bool,

    #[arg(short, long, default_value_t = RECOMMENDED_MAPPING_LIFETIME_SECONDS)]
    lifetime: u32,
}

fn main() {
    use clap::Parser as _;
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut iface = NetworkInterface::new("demo");
    iface.ipv4 = Some(Ipv4Config {
        address: args.address,
        router: args.gateway,
    });
    if let (Some(link_local), Some(router), Some(scope_id)) =
        (args.link_local, args.gateway6, args.scope_id)
    {
        iface.ipv6 = Some(Ipv6Config {
            link_local,
            site_local: None,
            global: Vec::new(),
            router,
            scope_id,
        });
    }
    let protocol = if args.udp {
        crab_pinhole::Protocol::Udp
    } else {
        crab_pinhole::Protocol::Tcp
    };

    let (_handle, reactor) = Reactor::spawn("pcp", move |reactor| {
        // The client is tied to the reactor thread, so it is created here.
        let client = PcpClient::new(ClientConfig::default());
        let families: &[Family] = if iface.ipv6.is_some() {
            &[Family::V4, Family::V6]
        } else {
            &[Family::V4]
        };
        let id = client.add_interface(iface);

        for &family in families {
            let requested = client.start(reactor, id, family).and_then(|()| {
                client.request_mapping(
                    id,
                    family,
                    protocol,
                    args.internal_port,
                    args.external_port,
                    args.lifetime,
                )
            });
            match requested {
                Ok(nonce) => println!("Requested {protocol} port {} over {family}, nonce {nonce}", args.internal_port),
                Err(e) => eprintln!("Failed to request a mapping over {family}: {e:#}"),
            }
        }
    })
    .expect("Could not start the reactor");

    // Runs until the process is interrupted.
    if let Err(e) = reactor.join().expect("Reactor thread panicked") {
        eprintln!("Reactor failed: {e:#}");
    }
}
