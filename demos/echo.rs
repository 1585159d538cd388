//! # Example: Echo service
//!
//! Boots a supervisor with the built-in [`LogWriter`] and an echo service,
//! sends a targeted request, schedules a few periodic ticks and shuts down.
//!
//! ```text
//! cargo run --example echo -- --app_log_install --app_log_level=debug
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use servisor::logging::LogWriter;
use servisor::{
    APP_SHUTDOWN, BoxError, ChannelId, ConfigLoader, Context, Event, Service, StopPredicate, Supervisor,
    register_channel_id,
};

struct Echo {
    channel: ChannelId,
}

impl Service for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn start(&self, ctx: &Context) -> Result<(), BoxError> {
        ctx.logger().info("echo ready");
        Ok(())
    }

    fn stop(&self, ctx: &Context) -> Result<(), BoxError> {
        ctx.logger().info("echo stopped");
        Ok(())
    }

    fn on_event(&self, event: &Event) -> Result<(), BoxError> {
        if let Some(text) = event.payload::<String>().filter(|_| event.is(self.channel)) {
            event.respond(text.to_uppercase());
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let echo = register_channel_id("echo");

    let supervisor = Supervisor::builder()
        .config(ConfigLoader::new().args(std::env::args().skip(1)))
        .service(Arc::new(LogWriter::new()))
        .service(Arc::new(Echo { channel: echo }))
        .listener(APP_SHUTDOWN, |event| {
            println!("[demo] shutting down ({})", event.describe());
            Ok(())
        })
        .build()?;

    let ctx = supervisor.new_context("demo");
    let reply = ctx.send_event_return(echo, "hello".to_string())?;
    println!("[demo] reply: {:?}", reply.response::<String>());

    let ticks = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&ticks);
    let done: StopPredicate = Arc::new(move || counted.load(Ordering::SeqCst) >= 3);
    let t = Arc::clone(&ticks);
    let scheduler = ctx.run_periodic(
        Duration::ZERO,
        Duration::from_millis(100),
        move |_| {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[demo] tick {n}");
            Ok(())
        },
        Some(done),
    )?;

    while !scheduler.is_terminated() {
        std::thread::sleep(Duration::from_millis(20));
    }

    supervisor.shutdown();
    println!("[demo] exit code {}", supervisor.wait_for_stop());
    Ok(())
}
