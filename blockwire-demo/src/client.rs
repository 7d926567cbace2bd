extern crate blockwire;
extern crate stderrlog;
extern crate tokio;

use blockwire::{ConnectOptions, Connection, TransportParams};

// Reads the first sector of an NBD export and hex dumps it, for testing the
// client against a real server:
//
// $ nbdkit -p 10809 memory 1M
// $ cargo run --bin blockwire-client -- nbd://localhost:10809/
//
// URI parsing here is the bare minimum for a demo; a real consumer would
// bring its own parser and hand TransportParams to the library.

#[tokio::main]
async fn main() {
    // Enable the crate debug logs via stderr.
    stderrlog::new()
        .color(stderrlog::ColorChoice::Never)
        .verbosity(3)
        .init()
        .unwrap();

    let uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "nbd://localhost:10809/".to_string());
    let (params, export_name) = parse_uri(&uri).expect("failed to parse NBD URI");

    let options = ConnectOptions {
        export_name,
        ..Default::default()
    };

    let mut conn = Connection::connect(&params, options)
        .await
        .expect("failed to connect to NBD server");

    println!(
        "connected: export {:?}, {} bytes, flavor {:?}",
        conn.export().name,
        conn.export().size,
        conn.flavor()
    );

    let sector = conn
        .read(0, 512, None)
        .await
        .expect("failed to read first sector");

    println!("first sector of {uri} =");
    for row in sector.chunks(16) {
        for byte in row {
            print!("{byte:02x}");
        }
        println!();
    }

    conn.close().await;
}

/// Splits an `nbd://host:port/export` URI into transport parameters and an
/// export name.
fn parse_uri(uri: &str) -> Option<(TransportParams, String)> {
    let rest = uri.strip_prefix("nbd://")?;

    let (authority, export) = match rest.split_once('/') {
        Some((authority, export)) => (authority, export),
        None => (rest, ""),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, 10809),
    };

    Some((
        TransportParams::Tcp {
            host: host.to_string(),
            port,
        },
        export.to_string(),
    ))
}
