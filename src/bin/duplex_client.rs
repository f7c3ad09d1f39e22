use std::{error::Error, process, thread, time::Duration};

use clap::{Parser, Subcommand};
use duplex::{
    Client, Code, Deadline, Status, with_timeout,
    services::{
        CalculatorClient, GreetClient,
        calculator::{
            ComputeAverageRequest, FindMaximumRequest, PrimeNumberDecompositionRequest,
            SquareRootRequest, SumRequest,
        },
        greet::{GreetRequest, Greeting},
    },
};
use log::debug;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the server
    #[arg(long, default_value = "127.0.0.1:50051")]
    address: String,
    /// Deadline for the call, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    call: Call,
}

#[derive(Debug, Subcommand)]
enum Call {
    /// greet.GreetService/Greet
    Greet { first_name: String, last_name: Option<String> },
    /// greet.GreetService/GreetWithDeadline
    GreetWithDeadline { first_name: String },
    /// greet.GreetService/GreetManyTimes
    GreetManyTimes { first_name: String },
    /// greet.GreetService/LongGreet
    LongGreet { first_names: Vec<String> },
    /// greet.GreetService/GreetEveryone
    GreetEveryone { first_names: Vec<String> },
    /// calculator.CalculatorService/Sum
    Sum { first: i32, second: i32 },
    /// calculator.CalculatorService/PrimeNumberDecomposition
    Primes { number: i64 },
    /// calculator.CalculatorService/ComputeAverage
    Average { numbers: Vec<i32> },
    /// calculator.CalculatorService/FindMaximum
    Maximum { numbers: Vec<i32> },
    /// calculator.CalculatorService/SquareRoot
    #[command(allow_negative_numbers = true)]
    SquareRoot { number: i32 },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = Client::connect(cli.address.as_str())?;
    let (deadline, _canceller) = with_timeout(cli.timeout_ms.map(Duration::from_millis));

    let outcome = run(&client, cli.call, deadline);
    client.close();

    if let Err(e) = outcome {
        match e.code() {
            Code::InvalidArgument => eprintln!("invalid argument: {}", e.message()),
            Code::DeadlineExceeded => eprintln!("deadline exceeded: {}", e.message()),
            _ => eprintln!("call failed: {e}"),
        }
        process::exit(1);
    }
    Ok(())
}

fn run(client: &Client, call: Call, deadline: Deadline) -> Result<(), Status> {
    let greet = GreetClient::new(client.clone());
    let calculator = CalculatorClient::new(client.clone());

    match call {
        Call::Greet {
            first_name,
            last_name,
        } => {
            let greeting = Greeting::new(first_name, last_name.unwrap_or_default());
            println!("{}", greet.greet(greeting, deadline)?.result);
        }
        Call::GreetWithDeadline { first_name } => {
            let response = greet.greet_with_deadline(Greeting::new(first_name, ""), deadline)?;
            println!("{}", response.result);
        }
        Call::GreetManyTimes { first_name } => {
            for response in greet.greet_many_times(Greeting::new(first_name, ""), deadline)? {
                println!("{}", response?.result);
            }
        }
        Call::LongGreet { first_names } => {
            let call = greet.long_greet(deadline)?;
            for first_name in first_names {
                debug!("sending {first_name}");
                call.send(GreetRequest {
                    greeting: Greeting::new(first_name, ""),
                })?;
            }
            println!("{}", call.finish()?.result);
        }
        Call::GreetEveryone { first_names } => {
            let (sink, responses) = greet.greet_everyone(deadline)?;
            let sender = thread::spawn(move || {
                for first_name in first_names {
                    sink.send(GreetRequest {
                        greeting: Greeting::new(first_name, ""),
                    })?;
                }
                sink.close_send()
            });
            for response in responses {
                println!("{}", response?.result);
            }
            sender
                .join()
                .map_err(|_| Status::internal("sender thread panicked"))??;
        }
        Call::Sum { first, second } => {
            let request = SumRequest {
                first_number: first,
                second_number: second,
            };
            println!("{}", calculator.sum(request, deadline)?.sum_result);
        }
        Call::Primes { number } => {
            let request = PrimeNumberDecompositionRequest { number };
            for response in calculator.prime_number_decomposition(request, deadline)? {
                println!("{}", response?.prime_factor);
            }
        }
        Call::Average { numbers } => {
            let call = calculator.compute_average(deadline)?;
            for number in numbers {
                call.send(ComputeAverageRequest { number })?;
            }
            println!("{}", call.finish()?.average);
        }
        Call::Maximum { numbers } => {
            let (sink, responses) = calculator.find_maximum(deadline)?;
            let sender = thread::spawn(move || {
                for number in numbers {
                    sink.send(FindMaximumRequest { number })?;
                }
                sink.close_send()
            });
            for response in responses {
                println!("{}", response?.maximum);
            }
            sender
                .join()
                .map_err(|_| Status::internal("sender thread panicked"))??;
        }
        Call::SquareRoot { number } => {
            let response = calculator.square_root(SquareRootRequest { number }, deadline)?;
            println!("{}", response.number_root);
        }
    }
    Ok(())
}
