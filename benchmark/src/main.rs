use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use pb::kv_service_client::KvServiceClient;
use pb::{GetRequest, OpenSessionRequest, RequestType, UpdateRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Delay between requests per client, in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server address
    #[arg(short, long, default_value = "grpc://127.0.0.1:8080")]
    server: String,

    /// OpenSession password
    #[arg(short, long, default_value = "")]
    password: String,

    /// Fraction of requests that are reads, in percent
    #[arg(short, long, default_value = "50")]
    reads: u64,
}

pub mod pb {
    tonic::include_proto!("kvservice");
}

async fn open_session(server_addr: &str, password: &str) -> Option<String> {
    let mut client = match KvServiceClient::connect(server_addr.to_string()).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to connect to server: {}", e);
            return None;
        }
    };
    let request = tonic::Request::new(OpenSessionRequest {
        request_type: RequestType::OpenSession as i32,
        password: password.to_string(),
    });
    match client.open_session(request).await {
        Ok(reply) => {
            let reply = reply.into_inner();
            if reply.err_code == pb::ErrCode::Ok as i32 {
                println!("Session opened: {}", reply.session_id);
                Some(reply.session_id)
            } else {
                eprintln!("OpenSession rejected, err_code={}", reply.err_code);
                None
            }
        }
        Err(e) => {
            eprintln!("OpenSession failed: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, interval {} ms, {}% reads",
        args.concurrency, args.interval, args.reads
    );

    let session_id = match open_session(&server_addr, &args.password).await {
        Some(id) => id,
        None => return Ok(()),
    };

    let mut handles = vec![];
    for cli in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let session_id = session_id.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let interval = args.interval;
        let reads = args.reads;

        let handle = tokio::spawn(async move {
            let mut client = match KvServiceClient::connect(server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server: {}", e);
                    return;
                }
            };

            loop {
                let key = format!("bench-{}-{}", cli, rand::random::<u64>() % 100);
                let start = Instant::now();

                let outcome = if rand::random::<u64>() % 100 < reads {
                    client
                        .get(tonic::Request::new(GetRequest {
                            request_type: RequestType::Get as i32,
                            key,
                            session_id: session_id.clone(),
                        }))
                        .await
                        .map(|_| ())
                } else {
                    client
                        .update(tonic::Request::new(UpdateRequest {
                            request_type: RequestType::Put as i32,
                            key,
                            value: rand::random::<u64>().to_string(),
                            session_id: session_id.clone(),
                        }))
                        .await
                        .map(|_| ())
                };

                match outcome {
                    Ok(()) => {
                        let cost = start.elapsed();
                        let mut hist = histogram.lock().await;
                        hist.record(cost.as_micros() as u64).unwrap();
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
