use std::env;
use std::fs;

use rudp::ClientOptions;

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let peer = args.next().unwrap_or_else(|| "127.0.0.1:34343".to_string());
    let path = args.next();

    let addr: std::net::SocketAddr = peer.parse().expect("peer must be HOST:PORT");

    println!(">>> connecting to {addr}...");
    let stream = rudp::Client::connect(addr, ClientOptions::default()).unwrap();
    println!(">>> connected");

    let payload = match path {
        Some(path) => fs::read(&path).unwrap_or_else(|e| panic!("reading {path}: {e}")),
        None => b"the quick brown fox jumps over the lazy dog".to_vec(),
    };

    stream.send_bytes(&payload).unwrap();
    println!(">>> sent {} bytes", payload.len());

    stream.close().unwrap();
    println!(">>> closed, metrics: {:?}", stream.metrics());
}
