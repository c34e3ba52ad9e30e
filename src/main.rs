use std::time::*;

use planeserv::{NetPump, Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut args = std::env::args_os();

    let config = if let Some(path) = args.nth(1) {
        ServerConfig::load(path)?
    } else {
        let config = ServerConfig::default();
        config.validate()?;
        config
    };
    let pump = NetPump::start(config.pump()?)?;
    let mut server = Server::new(&config, pump)?;

    let interval = config.tick_interval();
    let starttime = Instant::now();
    let mut last = starttime;
    let mut tick: u32 = 0;
    loop {
        let now = Instant::now();
        server.update((now - last).as_secs_f32());
        last = now;

        tick = tick.wrapping_add(1);
        let next_tick_due = starttime + interval * tick;
        if let Some(wait) = next_tick_due.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        } else {
            log::debug!("tick {tick} is running late");
        }
    }
}
