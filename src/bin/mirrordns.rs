use std::env;
use std::sync::Arc;

use getopts::Options;

use mirrordns::dns::context::{ServerContext, REFLECT_ZONE, STORE_ZONE};
use mirrordns::dns::reflect::ReflectHandler;
use mirrordns::dns::server::{DnsServer, DnsTcpServer, DnsUdpServer};
use mirrordns::dns::store::{MemoryRecordStore, StoreHandler};
use mirrordns::dns::tsig::TsigKeyTable;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the mirrordns reflection server
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("p", "port", "port to listen on for UDP and TCP", "PORT");
    opts.optflag("", "print", "dump every reply to the log before sending");
    opts.optflag("c", "compress", "use label compression in replies");
    opts.optflag("", "pool", "serve UDP receives out of a buffer pool");
    opts.optopt(
        "t",
        "tsig",
        "TSIG key for signing and verification (hmac-sha256)",
        "NAME:BASE64",
    );
    opts.optmulti(
        "r",
        "record",
        format!("seed an A record under {}", STORE_ZONE).as_str(),
        "NAME:IPV4",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => panic!("{}", f.to_string()),
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let mut context = Arc::new(ServerContext::new());

    if let Some(ctx) = Arc::get_mut(&mut context) {
        if let Some(port) = opt_matches.opt_str("p") {
            match port.parse::<u16>() {
                Ok(port) => ctx.dns_port = port,
                Err(_) => {
                    log::info!("Port {} is not valid, using {}", port, ctx.dns_port);
                }
            }
        }

        ctx.print_replies = opt_matches.opt_present("print");
        ctx.compress_replies = opt_matches.opt_present("c");
        ctx.enable_pooling = opt_matches.opt_present("pool");

        if let Some(spec) = opt_matches.opt_str("t") {
            match TsigKeyTable::from_spec(&spec) {
                Ok(keys) => ctx.tsig_keys = keys,
                Err(e) => {
                    log::error!("Bad TSIG key spec: {}", e);
                    std::process::exit(1);
                }
            }
        }

        let mut store = MemoryRecordStore::new();
        for row in opt_matches.opt_strs("r") {
            match row.split_once(':') {
                Some((name, addr)) => store.insert(name, "A", 3600, addr),
                None => {
                    log::info!("Ignoring record {} without a NAME:IPV4 separator", row);
                }
            }
        }

        ctx.handlers
            .register(REFLECT_ZONE, Arc::new(ReflectHandler::new()));
        ctx.handlers
            .register(STORE_ZONE, Arc::new(StoreHandler::new(Arc::new(store))));
    }

    log::info!("Listening on port {}", context.dns_port);

    let udp_server = DnsUdpServer::new(context.clone(), 20);
    if let Err(e) = udp_server.run_server() {
        log::error!("Failed to bind UDP listener: {:?}", e);
        std::process::exit(1);
    }

    let tcp_server = DnsTcpServer::new(context.clone(), 20);
    if let Err(e) = tcp_server.run_server() {
        log::error!("Failed to bind TCP listener: {:?}", e);
        std::process::exit(1);
    }

    // both listeners run on their own threads; nothing left to do here
    loop {
        std::thread::park();
    }
}
