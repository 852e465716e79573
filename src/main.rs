use color_eyre::{eyre::eyre, Result};
use hidpad::bluetooth::replay::{Capture, ReplayStack};
use hidpad::bluetooth::{ConnectTrigger, DriverHandle, HidSession};
use hidpad::config::{DriverConfig, LogSettings};
use hidpad::gamepad::usages::usage_name;
use hidpad::gamepad::GamepadEvent;
use rppal::gpio::{Event, Gpio, InputPin, Trigger};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(DriverConfig::default_path);
    DriverConfig::ensure_default(&config_path)
        .await
        .map_err(|e| eyre!("Failed to create default config: {}", e))?;
    let config = DriverConfig::load(&config_path)
        .await
        .map_err(|e| eyre!("Failed to load config {:?}: {}", config_path, e))?;

    setup_logging(&config.logging);
    info!("Using configuration {:?}", config_path);

    let session = HidSession::new(config.session_settings(), Box::new(print_action));
    let stack = ReplayStack::new();
    let requests = stack.log();

    let mut handle = DriverHandle::spawn(session, Box::new(stack))
        .map_err(|e| eyre!("Failed to spawn HID host driver: {}", e))?;
    let trigger = handle.connect_trigger(config.connect_debounce());

    // Keeps the interrupt registered for as long as it lives
    let _button = match config.connect_button_pin {
        Some(pin) => match setup_connect_button(pin, trigger.clone()) {
            Ok(button) => Some(button),
            Err(e) => {
                warn!("Connect button on GPIO {} unavailable: {}", pin, e);
                None
            }
        },
        None => None,
    };

    match &config.capture {
        Some(path) => replay_capture(path, &handle).await?,
        None => info!("No capture configured, waiting for host stack notifications"),
    }

    info!("HID host running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;

    handle
        .shutdown()
        .await
        .map_err(|e| eyre!("Failed to stop HID host driver: {}", e))?;
    debug!("Host stack saw {} requests", requests.snapshot().len());
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(settings: &LogSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(settings.with_thread_ids)
        .with_file(settings.with_file)
        .with_line_number(settings.with_file);

    if settings.pretty {
        builder.pretty().init();
    } else {
        builder.init();
    }
}

/// Connect button wired between the pin and ground, pressed on the rising edge
fn setup_connect_button(pin: u8, trigger: ConnectTrigger) -> Result<InputPin> {
    let mut button = Gpio::new()?.get(pin)?.into_input_pullup();
    button.set_async_interrupt(Trigger::RisingEdge, None, move |_event: Event| {
        info!("Connect button pressed");
        trigger.fire();
    })?;
    info!("Connect button armed on GPIO {}", pin);
    Ok(button)
}

async fn replay_capture(path: &Path, handle: &DriverHandle) -> Result<()> {
    let capture = Capture::load(path).map_err(|e| eyre!("Failed to load capture: {}", e))?;
    let events = capture
        .stack_events()
        .map_err(|e| eyre!("Invalid capture {:?}: {}", path, e))?;
    info!("Replaying {} notifications from {:?}", events.len(), path);

    for event in events {
        handle
            .notify(event)
            .await
            .map_err(|e| eyre!("Replay interrupted: {}", e))?;
        if capture.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(capture.interval_ms)).await;
        }
    }
    info!("Replay finished, connection state: {}", handle.state());
    Ok(())
}

fn print_action(event: GamepadEvent) {
    let Some(name) = usage_name(event.page, event.code) else {
        debug!("Unmapped input {:?}", event);
        return;
    };

    if event.analog {
        println!("{} {}", name, event.value);
    } else if event.value == 0 {
        println!("{} released\n", name);
    } else if event.value == 1 {
        println!("{} pressed", name);
    }
}
