//! Minimal telemetry publisher over the mio TCP driver.
//!
//! Run with: cargo run -p mqcell-client --example telemetry

use mqcell_client::{
    ConnectStatus, Event, EventHandler, QoS, SessionOptions, TcpDriver, Will,
};

#[derive(Default)]
struct Telemetry {
    connected: bool,
    finished: bool,
}

impl EventHandler for Telemetry {
    fn on_event(&mut self, event: Event<'_>) {
        match event {
            Event::Connect {
                status: ConnectStatus::Accepted,
            } => {
                println!("Connected");
                self.connected = true;
            }
            Event::Connect { status } => {
                eprintln!("Connection failed: {:?}", status);
                self.finished = true;
            }
            Event::Publish { res, .. } => {
                println!("Publish result: {:?}", res);
                self.finished = true;
            }
            Event::Disconnect { is_accepted } => {
                println!("Disconnected (accepted: {})", is_accepted);
                self.finished = true;
            }
            _ => {}
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut driver: TcpDriver = TcpDriver::new(2048, 1024)?;
    let options = SessionOptions::new("mqcell-telemetry")
        .keep_alive(30)
        .will(Will::new("telemetry/status", "offline"));
    driver.client().connect("localhost", 1883, options)?;
    println!("Connecting to broker...");

    let mut handler = Telemetry::default();
    let mut published = false;
    loop {
        driver.drive(&mut handler)?;

        if handler.connected && !published {
            driver
                .client()
                .publish("telemetry/temperature", b"23.5", QoS::AtLeastOnce, false, ())?;
            published = true;
        }
        if handler.finished {
            if driver.client().is_connected() {
                driver.client().disconnect()?;
                handler.finished = false;
            } else {
                return Ok(());
            }
        }
    }
}
