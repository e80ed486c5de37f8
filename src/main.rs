use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{App, Arg, ArgMatches};
use lazy_static::lazy_static;
use log::{error, info, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use usb_proxy::descriptors::DescriptorCache;
use usb_proxy::proxy::{Proxy, ProxyConfig};
use usb_proxy::raw_gadget::RawGadget;
use usb_proxy::upstream::UsbHostDevice;

lazy_static! {
    static ref RUNNING: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
}

extern "C" fn handle_shutdown(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // No SA_RESTART: the blocking event-fetch ioctl must return EINTR so the
    // event loop notices the cleared flag.
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in &[Signal::SIGINT, Signal::SIGTERM] {
        if let Err(err) = unsafe { sigaction(*signal, &action) } {
            warn!("could not install {:?} handler: {}", signal, err);
        }
    }
}

fn parse_hex_id(value: &str) -> Option<u16> {
    u16::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

fn required_hex(matches: &ArgMatches<'_>, name: &str) -> u16 {
    match matches.value_of(name).and_then(parse_hex_id) {
        Some(value) => value,
        None => {
            error!("--{} must be a 16-bit hex value", name);
            process::exit(1);
        }
    }
}

fn run_proxy(
    vendor_id: u16,
    product_id: u16,
    gadget_path: &Path,
    config: ProxyConfig,
) -> usb_proxy::Result<()> {
    let upstream = Arc::new(UsbHostDevice::open(vendor_id, product_id)?);
    let cache = DescriptorCache::populate(upstream.as_ref())?;
    let gadget = Arc::new(RawGadget::open_path(gadget_path)?);

    let proxy = Proxy::new(gadget, upstream, cache, config, RUNNING.clone());
    proxy.run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = App::new("usb-proxy")
        .about("Mirrors a USB device towards a downstream host through the Linux raw-gadget interface")
        .arg(
            Arg::with_name("vendor_id")
                .long("vendor_id")
                .value_name("HEX")
                .help("Vendor ID of the device to mirror")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("product_id")
                .long("product_id")
                .value_name("HEX")
                .help("Product ID of the device to mirror")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .long("device")
                .value_name("NAME")
                .help("UDC device name")
                .takes_value(true)
                .default_value("dummy_udc.0"),
        )
        .arg(
            Arg::with_name("driver")
                .long("driver")
                .value_name("NAME")
                .help("UDC driver name")
                .takes_value(true)
                .default_value("dummy_udc"),
        )
        .arg(
            Arg::with_name("gadget-path")
                .long("gadget-path")
                .value_name("PATH")
                .help("raw-gadget character device")
                .takes_value(true)
                .default_value("/dev/raw-gadget"),
        )
        .get_matches();

    let vendor_id = required_hex(&matches, "vendor_id");
    let product_id = required_hex(&matches, "product_id");
    let config = ProxyConfig {
        driver: matches.value_of("driver").unwrap_or("dummy_udc").to_string(),
        device: matches
            .value_of("device")
            .unwrap_or("dummy_udc.0")
            .to_string(),
    };
    let gadget_path = matches.value_of("gadget-path").unwrap_or("/dev/raw-gadget");

    install_signal_handlers();

    info!(
        "proxying {:04x}:{:04x} through {}/{}",
        vendor_id, product_id, config.driver, config.device
    );

    if let Err(err) = run_proxy(vendor_id, product_id, Path::new(gadget_path), config) {
        error!("fatal: {}", err);
        process::exit(1);
    }

    info!("shutdown complete");
}
