use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hwcomposer_drm::{
    compositor::{Capability, Composer, DisplayAttribute, HwComposer},
    config::ComposerConfig,
    display::DisplayIndex,
};

#[derive(Debug, Parser)]
#[command(about = "Open the display device, print what the composer sees and count vertical blanks")]
struct Cli {
    /// Kernel drivers to try, in order (defaults to HWC_DRM_DRIVER or the built-in list)
    #[arg(long, value_delimiter = ',')]
    driver: Vec<String>,
    /// Allow overlay planes on the external display
    #[arg(long)]
    external_overlays: bool,
    /// Seconds to listen for vertical blanks
    #[arg(long, default_value_t = 2)]
    listen: u64,
}

fn main() {
    let args = Cli::parse();

    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let mut config = ComposerConfig::from_env();
    if !args.driver.is_empty() {
        config.drivers = args.driver;
    }
    config.external_overlays |= args.external_overlays;

    let mut composer = HwComposer::open(config).expect("Failed to open the display device");
    println!(
        "vsync period: {}ns, displays: {:#b}",
        composer.query(Capability::VsyncPeriod),
        composer.query(Capability::DisplayTypesSupported)
    );

    for display in DisplayIndex::ALL {
        let Ok(configs) = composer.display_configs(display) else {
            println!("{:?}: not connected", display);
            continue;
        };
        for config in configs {
            let values = composer
                .display_attributes(
                    display,
                    config,
                    &[
                        DisplayAttribute::Width,
                        DisplayAttribute::Height,
                        DisplayAttribute::VsyncPeriod,
                        DisplayAttribute::DpiX,
                        DisplayAttribute::DpiY,
                    ],
                )
                .expect("Failed to query display attributes");
            println!(
                "{:?} config {}: {}x{}, {}ns, {}x{} dpki",
                display, config, values[0], values[1], values[2], values[3], values[4]
            );
        }
    }

    let counters = Arc::new([AtomicU64::new(0), AtomicU64::new(0)]);
    let observed = counters.clone();
    composer.register_vsync_observer(Arc::new(move |display: DisplayIndex, _timestamp: i64| {
        observed[display.index()].fetch_add(1, Ordering::Relaxed);
    }));
    for display in DisplayIndex::ALL {
        let _ = composer.set_vsync_enabled(display, true);
    }

    std::thread::sleep(Duration::from_secs(args.listen));
    for display in DisplayIndex::ALL {
        println!(
            "{:?}: {} vertical blanks in {}s",
            display,
            counters[display.index()].load(Ordering::Relaxed),
            args.listen
        );
    }

    print!("{}", composer.dump());
    composer.close();
}
