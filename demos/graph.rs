use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::info;
use ondemand::{Future, Token};

/// An ondemand example.
///
/// Builds a small graph of dependent computations. Which of them actually run
/// depends on the `--foo` and `--bar` switches: computations nobody asks for
/// are never executed.
#[derive(Parser, Debug)]
struct Args {
    /// Ask for the greeting.
    #[arg(long)]
    foo: bool,

    /// Ask for the slowly computed number.
    #[arg(long)]
    bar: bool,

    /// Give up waiting for the final result after this many milliseconds.
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// How long the slow computation takes, in milliseconds.
    #[arg(long, default_value_t = 500)]
    work_ms: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let token = match args.timeout_ms {
        Some(ms) => Token::with_timeout(Duration::from_millis(ms)),
        None => Token::never(),
    };

    let work = Duration::from_millis(args.work_ms);

    let f1 = Future::<_, String>::new(move || {
        info!("computing the number");
        std::thread::sleep(work);
        Ok(42)
    })
    .named("number");

    let f2 = {
        let f1 = f1.clone();
        let token = token.clone();
        Future::new(move || {
            let n = f1.result(&token).map_err(|e| format!("number: {e}"))?;
            Ok::<_, String>(format!("n={n}"))
        })
        .named("format")
    };

    let f3 = Future::<_, String>::new(|| {
        info!("computing the greeting");
        Ok("hello".to_owned())
    })
    .non_blocking();

    let f4 = {
        let token = token.clone();
        let (foo, bar) = (args.foo, args.bar);
        Future::new(move || {
            if foo && bar {
                // Needed later on, so start it while we work on the greeting.
                f2.eager();
            }

            let mut s = Vec::new();

            if foo {
                s.push(f3.result(&token).map_err(|e| format!("greeting: {e}"))?);
            }

            if bar {
                s.push(f2.result(&token).map_err(|e| format!("format: {e}"))?);
            }

            Ok::<_, String>(s)
        })
        .named("join")
    };

    let start = Instant::now();

    let parts = f4
        .result(&token)
        .map_err(|e| anyhow!("{e}"))
        .context("Could not compute the result")?;

    println!("{} ({:?})", parts.join(" "), start.elapsed());
    println!("number computed: {}", f1.is_completed());

    Ok(())
}
