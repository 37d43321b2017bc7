use bytes::Bytes;
use clap::Parser;
use protocol::packets::{UnconnectedPing, UnconnectedPong};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Pings a relay (or any RakNet server) and prints its status line
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address of the server to probe
    #[clap(short, long, default_value = "127.0.0.1:19132")]
    target: SocketAddr,
    /// Number of pings to send
    #[clap(short, long, default_value = "3")]
    count: u32,
    /// Milliseconds to wait for each pong
    #[clap(long, default_value = "1000")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);

    let client_guid: i64 = rand::random();
    let started = Instant::now();
    let mut buf = [0u8; 2048];

    for i in 0..args.count {
        let ping = UnconnectedPing {
            time: started.elapsed().as_millis() as i64,
            client_guid,
        };
        socket.send_to(&ping.encode(), args.target).await?;

        match timeout(Duration::from_millis(args.timeout), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match UnconnectedPong::decode(Bytes::copy_from_slice(&buf[..len])) {
                Ok(pong) => {
                    let rtt = started.elapsed().as_millis() as i64 - pong.time;
                    println!("Pong {} from {} in {}ms (guid {})", i + 1, from, rtt, pong.server_guid);
                    print_status(&pong.motd);
                }
                Err(e) => println!("Unexpected reply from {}: {}", from, e),
            },
            Ok(Err(e)) => println!("Error receiving pong: {}", e),
            Err(_) => println!("Ping {} timed out", i + 1),
        }

        if i + 1 < args.count {
            sleep(Duration::from_millis(500)).await;
        }
    }

    Ok(())
}

fn print_status(motd: &str) {
    let fields: Vec<&str> = motd.split(';').collect();
    if fields.len() < 7 {
        println!("  status: {}", motd);
        return;
    }
    println!("  name:    {}", fields[1]);
    println!("  version: {} (protocol {})", fields[3], fields[2]);
    println!("  players: {}/{}", fields[4], fields[5]);
}
