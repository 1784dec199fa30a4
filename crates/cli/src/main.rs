use std::cell::RefCell;
use std::collections::BTreeMap;
use std::env;
use std::process;
use std::ptr::addr_of_mut;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use racetrap::{Controller, EngineConfig, EngineError, SelectorConfig, Session};

const SCENARIOS: &[&str] = &["hello", "counter", "mutex"];

static COUNTER: AtomicU64 = AtomicU64::new(0);
static GLOBAL: AtomicU64 = AtomicU64::new(0);
static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

extern "C" fn hello(arg: usize) -> i32 {
    arg as i32
}

#[inline(never)]
extern "C" fn increment(_arg: usize) -> i32 {
    let v = COUNTER.load(Ordering::Relaxed);
    COUNTER.store(v + 1, Ordering::Relaxed);
    0
}

#[inline(never)]
fn add(x: u64) -> u64 {
    let v = GLOBAL.load(Ordering::Relaxed) + x;
    GLOBAL.store(v, Ordering::Relaxed);
    v
}

extern "C" fn guarded(_arg: usize) -> i32 {
    unsafe {
        libc::pthread_mutex_lock(addr_of_mut!(MUTEX));
    }
    GLOBAL.store(1, Ordering::Relaxed);
    assert_eq!(GLOBAL.load(Ordering::Relaxed), 1);
    let v = add(1);
    assert_eq!(v, 2);
    unsafe {
        libc::pthread_mutex_unlock(addr_of_mut!(MUTEX));
    }
    0
}

struct Options {
    config: EngineConfig,
    scenarios: Vec<String>,
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = parse_args(&args);

    let mut failed = false;
    for name in &options.scenarios {
        println!("== {}", name);
        if let Err(e) = run_scenario(name, options.config.clone()) {
            println!("FAIL: {}", name);
            eprintln!("{}", e);
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: racetrap-selftest [options] [scenario...]");
    eprintln!();
    eprintln!("Scenarios: {} (default: all)", SCENARIOS.join(", "));
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --runs <n>              Number of rounds per scenario");
    eprintln!("  --time-limit <ms>       Time budget per scenario when no run count is set");
    eprintln!("  --seed <s>              Seed for the random selector");
    eprintln!("  --buckets <a,b,...>     Use the bucket selector");
    eprintln!("  --help, -h              Show this help message");
    eprintln!();
    eprintln!("Defaults come from the RACETRAP_* environment variables.");
}

fn fail(message: String) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn number(flag: &str, value: Option<&String>) -> u64 {
    match value.map(|v| v.parse::<u64>()) {
        Some(Ok(n)) => n,
        Some(Err(_)) => fail(format!("{} expects a number", flag)),
        None => fail(format!("{} requires a value", flag)),
    }
}

fn parse_args(args: &[String]) -> Options {
    let mut config = EngineConfig::from_env().unwrap_or_else(|e| fail(e.to_string()));
    if config.runs == 0 && config.time_limit_ms == 0 {
        config.runs = 20;
    }
    let mut scenarios = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--runs" => {
                config.runs = number("--runs", args.get(i + 1));
                i += 2;
            }
            "--time-limit" => {
                config.time_limit_ms = number("--time-limit", args.get(i + 1));
                config.runs = 0;
                i += 2;
            }
            "--seed" => {
                config.selector = SelectorConfig::Random { seed: Some(number("--seed", args.get(i + 1))) };
                i += 2;
            }
            "--buckets" => {
                let list = args.get(i + 1).unwrap_or_else(|| fail("--buckets requires a value".to_string()));
                config.selector = racetrap::config::parse_selector(&format!("buckets:{}", list))
                    .unwrap_or_else(|e| fail(e.to_string()));
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                print_usage();
                process::exit(1);
            }
            name if SCENARIOS.contains(&name) => {
                scenarios.push(name.to_string());
                i += 1;
            }
            name => fail(format!("unknown scenario {} (expected one of {})", name, SCENARIOS.join(", "))),
        }
    }

    if let Err(e) = config.validate() {
        fail(e.to_string());
    }
    if scenarios.is_empty() {
        scenarios = SCENARIOS.iter().map(|s| s.to_string()).collect();
    }
    Options { config, scenarios }
}

fn run_scenario(name: &str, config: EngineConfig) -> Result<(), EngineError> {
    let mut ctl = Controller::for_current_process_with(config)?;
    let outcomes = Rc::new(RefCell::new(BTreeMap::new()));

    match name {
        "hello" => {
            ctl.add_thread(hello, 1)?;
            ctl.add_thread(hello, 2)?;
        }
        "counter" => {
            ctl.add_thread(increment, 0)?;
            ctl.add_thread(increment, 1)?;
            let seen = Rc::clone(&outcomes);
            ctl.set_round_observer(move |session: &Session<'_>| -> Result<(), EngineError> {
                let value = session.process().read_word(&COUNTER as *const AtomicU64 as u64)?;
                *seen.borrow_mut().entry(value).or_insert(0u64) += 1;
                Ok(())
            });
        }
        "mutex" => {
            ctl.add_thread(guarded, 0)?;
            ctl.add_thread(guarded, 1)?;
        }
        _ => return Err(EngineError::Config(format!("unknown scenario {}", name))),
    }

    let summary = ctl.run()?;
    println!("PASS: {} ({} rounds in {:?}, {})", name, summary.rounds, summary.elapsed, summary.selector);
    for (value, count) in outcomes.borrow().iter() {
        println!("  counter = {}: {} rounds", value, count);
    }
    Ok(())
}
