//! AOA 2.0 host state machine and the blocking bulk transport it produces.
//!
//! Mirrors the reference CLI's `usb/mod.rs` (blocking `rusb`, claim
//! interface, bulk read/write with timeouts) generalized from a fixed
//! vendor-specific ADB interface to the AOA accessory-mode negotiation
//! described in the spec.

use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::error::{DriverError, Result};

pub const ACCESSORY_VENDOR_ID: u16 = 0x18D1;
pub const ACCESSORY_PRODUCT_ID: u16 = 0x2D00;
pub const ACCESSORY_PRODUCT_ID_ADB: u16 = 0x2D01;

const REQUEST_GET_PROTOCOL: u8 = 51;
const REQUEST_SEND_STRING: u8 = 52;
const REQUEST_START_ACCESSORY: u8 = 53;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WAIT_FOR_ACCESSORY_POLL: Duration = Duration::from_millis(100);
const WAIT_FOR_ACCESSORY_TOTAL: Duration = Duration::from_secs(3);
const INTERFACE_NUMBER: u8 = 0;

/// NUL-terminated identification strings sent during accessory-mode
/// negotiation (request 52, index 0..5).
#[derive(Debug, Clone)]
pub struct AccessoryIdentity {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "AOA Mirror Host".into(),
            model: "Screen Mirror".into(),
            description: "Host-side AOA 2.0 screen mirror driver".into(),
            version: "1.0".into(),
            uri: "https://example.invalid/aoa-mirror-host".into(),
            serial: "0001".into(),
        }
    }
}

impl AccessoryIdentity {
    fn as_ordered_strings(&self) -> [&str; 6] {
        [
            &self.manufacturer,
            &self.model,
            &self.description,
            &self.version,
            &self.uri,
            &self.serial,
        ]
    }
}

/// Outcome of a single bulk-IN read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes received; may be shorter than requested, including zero.
    Data(Vec<u8>),
    /// No bytes arrived within the timeout window. Not an error: the pump
    /// uses this to poll so that stop requests stay responsive.
    Timeout,
}

/// Boundary the pipeline's USB pump worker runs against instead of the
/// concrete [`Transport`], so it can be driven by a fake in tests without
/// real hardware.
pub trait UsbTransport: Send {
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<ReadOutcome>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn disconnect(&mut self);
}

impl UsbTransport for Transport {
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<ReadOutcome> {
        Transport::read(self, max_len, timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        Transport::write(self, data)
    }

    fn disconnect(&mut self) {
        Transport::disconnect(self)
    }
}

/// A connected AOA accessory-mode device with claimed bulk endpoints.
pub struct Transport {
    handle: DeviceHandle<Context>,
    ep_in: u8,
    ep_out: u8,
}

impl Transport {
    /// Run the full AOA 2.0 state machine: look for a device already in
    /// accessory mode, otherwise negotiate the mode switch and wait for the
    /// device to re-enumerate, then claim the interface.
    pub fn connect(identity: &AccessoryIdentity) -> Result<Self> {
        let ctx = Context::new()?;

        if let Some((device, ep_in, ep_out)) = find_accessory_device(&ctx)? {
            info!("device already in accessory mode");
            return Self::claim(device, ep_in, ep_out);
        }

        let (device, version) = find_android_device(&ctx)?
            .ok_or_else(|| DriverError::TransportOpen("no Android device found".into()))?;
        info!("AOA protocol version {}", version);

        let handle = device.open()?;
        send_accessory_strings(&handle, identity)?;
        start_accessory_mode(&handle)?;
        // Scoped release: the device will re-enumerate under a new address.
        drop(handle);
        drop(device);

        info!("waiting for device to re-enumerate in accessory mode");
        let (device, ep_in, ep_out) = wait_for_accessory(&ctx)?;
        Self::claim(device, ep_in, ep_out)
    }

    fn claim(device: Device<Context>, ep_in: u8, ep_out: u8) -> Result<Self> {
        let mut handle = device.open()?;
        match handle.kernel_driver_active(INTERFACE_NUMBER) {
            Ok(true) => {
                if let Err(e) = handle.detach_kernel_driver(INTERFACE_NUMBER) {
                    warn!("could not detach kernel driver (continuing): {}", e);
                }
            }
            Ok(false) => {}
            Err(_) => { /* platform doesn't support kernel driver queries; ignore */ }
        }
        handle.claim_interface(INTERFACE_NUMBER)?;
        info!("claimed interface {}, ep_in=0x{:02x} ep_out=0x{:02x}", INTERFACE_NUMBER, ep_in, ep_out);
        Ok(Transport { handle, ep_in, ep_out })
    }

    /// Attempt a bulk-IN transfer of up to `max_len` bytes, waiting at most
    /// `timeout`. A timeout with no data is [`ReadOutcome::Timeout`], not an
    /// error.
    pub fn read(&mut self, max_len: usize, timeout: Duration) -> Result<ReadOutcome> {
        let mut buf = vec![0u8; max_len];
        match self.handle.read_bulk(self.ep_in, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(buf))
            }
            Err(rusb::Error::Timeout) => Ok(ReadOutcome::Timeout),
            Err(e) => Err(DriverError::TransportFatal(format!("bulk read failed: {}", e))),
        }
    }

    /// Issue a bulk-OUT transfer; succeeds only if every byte was accepted.
    /// A partial write is reported as fatal, matching the spec.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let n = self
            .handle
            .write_bulk(self.ep_out, data, CONTROL_TIMEOUT)
            .map_err(|e| DriverError::TransportFatal(format!("bulk write failed: {}", e)))?;
        if n != data.len() {
            return Err(DriverError::TransportFatal(format!(
                "partial bulk write: {} of {} bytes",
                n,
                data.len()
            )));
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let _ = self.handle.release_interface(INTERFACE_NUMBER);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn is_accessory_pid(pid: u16) -> bool {
    pid == ACCESSORY_PRODUCT_ID || pid == ACCESSORY_PRODUCT_ID_ADB
}

fn find_accessory_device(ctx: &Context) -> Result<Option<(Device<Context>, u8, u8)>> {
    for device in ctx.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() == ACCESSORY_VENDOR_ID && is_accessory_pid(desc.product_id()) {
            if let Some((ep_in, ep_out)) = find_bulk_endpoints(&device) {
                return Ok(Some((device, ep_in, ep_out)));
            }
        }
    }
    Ok(None)
}

fn find_android_device(ctx: &Context) -> Result<Option<(Device<Context>, u16)>> {
    for device in ctx.devices()?.iter() {
        let handle = match device.open() {
            Ok(h) => h,
            Err(_) => continue,
        };
        if let Some(version) = get_aoa_protocol_version(&handle) {
            if version >= 1 {
                return Ok(Some((device, version)));
            }
        }
    }
    Ok(None)
}

fn get_aoa_protocol_version(handle: &DeviceHandle<Context>) -> Option<u16> {
    let mut buf = [0u8; 2];
    let request_type = rusb::request_type(Direction::In, rusb::RequestType::Vendor, rusb::Recipient::Device);
    let n = handle
        .read_control(request_type, REQUEST_GET_PROTOCOL, 0, 0, &mut buf, CONTROL_TIMEOUT)
        .ok()?;
    if n != 2 {
        return None;
    }
    Some(u16::from_le_bytes(buf))
}

fn send_accessory_strings(handle: &DeviceHandle<Context>, identity: &AccessoryIdentity) -> Result<()> {
    let request_type = rusb::request_type(Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
    for (index, s) in identity.as_ordered_strings().iter().enumerate() {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        handle
            .write_control(request_type, REQUEST_SEND_STRING, 0, index as u16, &data, CONTROL_TIMEOUT)
            .map_err(|e| DriverError::TransportOpen(format!("send accessory string {}: {}", index, e)))?;
    }
    debug!("sent accessory identification strings");
    Ok(())
}

fn start_accessory_mode(handle: &DeviceHandle<Context>) -> Result<()> {
    let request_type = rusb::request_type(Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Device);
    handle
        .write_control(request_type, REQUEST_START_ACCESSORY, 0, 0, &[], CONTROL_TIMEOUT)
        .map_err(|e| DriverError::TransportOpen(format!("start accessory mode: {}", e)))?;
    Ok(())
}

fn wait_for_accessory(ctx: &Context) -> Result<(Device<Context>, u8, u8)> {
    let deadline = std::time::Instant::now() + WAIT_FOR_ACCESSORY_TOTAL;
    loop {
        if let Some(found) = find_accessory_device(ctx)? {
            return Ok(found);
        }
        if std::time::Instant::now() >= deadline {
            return Err(DriverError::TransportOpen(
                "device did not re-enumerate as accessory within timeout".into(),
            ));
        }
        std::thread::sleep(WAIT_FOR_ACCESSORY_POLL);
    }
}

fn find_bulk_endpoints(device: &Device<Context>) -> Option<(u8, u8)> {
    let config = device.active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            let mut ep_in = None;
            let mut ep_out = None;
            for ep in setting.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in = ep_in.or(Some(ep.address())),
                    Direction::Out => ep_out = ep_out.or(Some(ep.address())),
                }
            }
            if let (Some(i), Some(o)) = (ep_in, ep_out) {
                return Some((i, o));
            }
        }
    }
    None
}
