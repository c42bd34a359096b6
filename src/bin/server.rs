use std::env;
use std::io::Read;

fn main() {
    env_logger::init();

    let port: u16 = env::args()
        .nth(1)
        .map(|s| s.parse().expect("port must be a u16"))
        .unwrap_or(34343);
    let drop_rate: f64 = env::args().nth(2).map(|s| s.parse().unwrap()).unwrap_or(0.0);

    let server = rudp::server("0.0.0.0", port, drop_rate).unwrap();
    println!(">>> listening on {port}, waiting for incoming connections...");

    loop {
        let mut stream = server.accept().unwrap();
        println!(">>> accepted connection from {}", stream.peer_addr());

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();

        println!(
            ">>> received {} bytes, metrics: {:?}",
            buf.len(),
            stream.metrics()
        );
    }
}
