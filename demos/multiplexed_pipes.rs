//! Echoes messages through a set of pipes sharing one multiplexer.
//!
//! Run with `RUST_LOG=debug` to see the tracing output of the multiplexer.

use iomux::backend::create_multiplexer;
use iomux::buffer::{Buffer, ConstBuffer, IoRequest};
use iomux::config::{LoggingConfig, MultiplexerConfig};
use iomux::handle::NativeHandle;
use iomux::logging::{self, TracingOutput};
use iomux::{Deadline, LogLevel};
use std::error::Error;
use std::time::{Duration, Instant};

const PIPES: usize = 8;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = MultiplexerConfig {
        logging: LoggingConfig {
            enabled: true,
            level: LogLevel::Debug,
            json_format: false,
        },
        ..MultiplexerConfig::single_threaded()
    };
    let mux = create_multiplexer(&config)?;
    if let Ok(mut logger) = logging::init_logger().lock() {
        logger.clear_outputs();
        logger.add_output(Box::new(TracingOutput::new()));
    }
    println!("Using the {} multiplexer", mux.name());

    let mut pipes = Vec::with_capacity(PIPES);
    for _ in 0..PIPES {
        let (mut reader, mut writer) = NativeHandle::anonymous_pipe(true)?;
        reader.set_multiplexer(Some(mux.clone()))?;
        writer.set_multiplexer(Some(mux.clone()))?;
        pipes.push((reader, writer));
    }

    let started = Instant::now();
    for (index, (reader, writer)) in pipes.iter().enumerate() {
        let message = format!("message {index}");
        writer
            .write(
                IoRequest::single(ConstBuffer::new(message.as_bytes()), 0),
                Deadline::never(),
            )
            .into_result()?;

        let mut storage = [0u8; 64];
        let mut read = reader.read(
            IoRequest::single(Buffer::new(&mut storage), 0),
            Duration::from_secs(1),
        );
        let received = read.bytes_transferred();
        println!(
            "pipe {index}: {:?}",
            String::from_utf8_lossy(&storage[..received])
        );
    }

    let mut storage = [0u8; 64];
    let idle = pipes[0]
        .0
        .read(IoRequest::single(Buffer::new(&mut storage), 0), Duration::from_millis(100));
    match idle.error() {
        Some(e) if e.is_timed_out() => println!("idle pipe timed out as expected"),
        other => println!("idle pipe: {other:?}"),
    }

    println!(
        "{} round trips in {:?}, {} operations left in flight",
        PIPES,
        started.elapsed(),
        mux.operations_in_flight()
    );
    Ok(())
}
