//! tilesim: run demonstration programs on a simulated tile array

use std::env;

use anyhow::{bail, ensure, Context};
use tilesim::config::Config;
use tilesim::device::{
    Device, DeviceConfig, Direction, DmaCommand, MemorySpan, RouterPort, TileCoord,
};
use tilesim::pool::SchedulerPolicy;

const USAGE: &str = "usage: tilesim [stream|hello|heap] [--scheduler NAME] [--workers N] [--suspend]";

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = Config::get().clone();
    let mut demo = "hello";

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--scheduler" | "-s" => {
                let name = rest.next().context("--scheduler needs a policy name")?;
                config.scheduler = Some(name.parse::<SchedulerPolicy>()?);
            }
            "--workers" | "-w" => {
                let n = rest.next().context("--workers needs a count")?;
                config.worker_threads = Some(n.parse().context("invalid worker count")?);
            }
            "--suspend" => config.suspend_on_idle = Some(true),
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            "stream" | "hello" | "heap" => demo = arg.as_str(),
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }

    println!(
        "Scheduler: {} ({} worker(s), suspend on idle: {})",
        config.scheduler(),
        config.worker_threads(),
        config.suspend_on_idle()
    );

    match demo {
        "stream" => run_stream(&config),
        "heap" => run_heap(&config),
        _ => run_hello(&config),
    }
}

/// Every tile says hello through the log service.
fn run_hello(config: &Config) -> anyhow::Result<()> {
    let device = Device::new(DeviceConfig::from_config(config))?;
    println!("Array: {}x{}", device.columns(), device.rows());
    println!();

    let stats = device.run(|ctx| async move {
        let coord = ctx.coord();
        ctx.log(&format!("hello from tile {coord}")).await?;
        Ok(())
    })?;

    println!();
    println!(
        "{} tile(s) finished after {} service request(s)",
        stats.finished, stats.requests
    );
    device.shutdown()?;
    Ok(())
}

/// Stream sixteen words from one tile to its east neighbour through the
/// DMA engines and routers.
fn run_stream(config: &Config) -> anyhow::Result<()> {
    const WORDS: u32 = 16;

    let mut device_config = DeviceConfig::from_config(config);
    device_config.columns = 2;
    device_config.rows = 1;
    let device = Device::new(device_config)?;

    let west = TileCoord::new(0, 0);
    let east = TileCoord::new(1, 0);
    device.route(west, RouterPort::Dma(0), RouterPort::Link(Direction::East))?;
    device.route(east, RouterPort::Link(Direction::West), RouterPort::Dma(0))?;

    device.launch(west, |ctx| async move {
        let ptr = ctx.heap()?.malloc(WORDS * 4);
        let values: Vec<u32> = (0..WORDS).map(|i| i * i).collect();
        ctx.memory().write_words(ptr, &values);

        let tx = ctx.tx_dma(0)?;
        tx.push(DmaCommand::send(MemorySpan::new(ptr, WORDS))).await?;
        tx.wait().await?;
        ctx.log(&format!("sent {WORDS} words")).await?;
        ctx.heap()?.free(ptr);
        Ok(())
    })?;

    device.launch(east, |ctx| async move {
        let ptr = ctx.heap()?.malloc(WORDS * 4);
        let rx = ctx.rx_dma(0)?;
        rx.push(DmaCommand::receive(MemorySpan::new(ptr, WORDS))).await?;
        rx.wait().await?;

        let received = ctx.memory().read_words(ptr, WORDS as usize);
        ctx.heap()?.free(ptr);
        let text: Vec<String> = received.iter().map(u32::to_string).collect();
        ctx.log(&format!("received {}", text.join(" "))).await?;
        ensure!(
            received.iter().enumerate().all(|(i, &v)| v == (i * i) as u32),
            "stream corrupted"
        );
        Ok(())
    })?;

    device.wait_all()?;
    device.shutdown()?;
    println!("Stream OK");
    Ok(())
}

/// Allocate from the host and from the tile on the same heap.
fn run_heap(config: &Config) -> anyhow::Result<()> {
    let mut device_config = DeviceConfig::from_config(config);
    device_config.columns = 1;
    device_config.rows = 1;
    let device = Device::new(device_config)?;
    let coord = TileCoord::new(0, 0);

    let host_block = device
        .host_malloc(coord, 128)?
        .context("host allocation failed")?;
    println!("Host allocated 128 bytes at 0x{host_block:04X}");

    device.launch(coord, |ctx| async move {
        let heap = ctx.heap()?;
        let a = heap.malloc(40);
        let b = heap.malloc(200);
        let a = heap.realloc(a, 400);
        let free = heap.free_bytes();
        let largest = heap.largest_free();
        heap.free(b);
        heap.free(a);
        drop(heap);
        ctx.log(&format!("tile heap: {free} bytes free, largest block {largest}"))
            .await?;
        Ok(())
    })?;
    device.wait_all()?;

    println!();
    println!("Blocks:");
    for block in device.host_heap(coord)?.blocks() {
        println!(
            "  0x{:04X} {:6} bytes {}{}",
            block.payload,
            block.size,
            if block.in_use { "in use" } else { "free" },
            if block.host_allocated { " (host)" } else { "" }
        );
    }
    device.host_free(coord, host_block)?;
    device.shutdown()?;
    Ok(())
}
