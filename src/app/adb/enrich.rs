use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::parse::parse_getprop_map;
use crate::app::adb::wire;
use crate::app::error::WireError;
use crate::app::models::{DeviceEvent, DeviceInfo, DeviceType, EventKind};
use crate::app::registry::DeviceRegistry;

const GETPROP_TIMEOUT: Duration = Duration::from_secs(3);

/// Fetches getprop enrichment for a freshly online device and submits it as
/// an InfoUpdated. Failures are logged and swallowed; enrichment must never
/// disturb tracking.
pub fn enrich_device(endpoint: &str, serial: &str, registry: &DeviceRegistry) {
    match fetch_getprop(endpoint, serial) {
        Ok(props) => {
            let event = enrichment_event(serial, &props);
            debug!(serial = %serial, "submitting getprop enrichment");
            registry.submit(event);
        }
        Err(err) => {
            warn!(serial = %serial, error = %err, "getprop enrichment failed");
        }
    }
}

/// Opens a second smart-socket connection, selects the device transport and
/// streams `shell:getprop` until the server closes the stream.
pub fn fetch_getprop(endpoint: &str, serial: &str) -> Result<HashMap<String, String>, WireError> {
    let mut stream = TcpStream::connect(endpoint)?;
    stream.set_read_timeout(Some(GETPROP_TIMEOUT))?;

    wire::send_request(&mut stream, &format!("host:transport:{serial}"))?;
    wire::send_request(&mut stream, "shell:getprop")?;

    // shell: output is raw bytes until the server closes the connection.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    Ok(parse_getprop_map(&String::from_utf8_lossy(&raw)))
}

pub fn enrichment_event(serial: &str, props: &HashMap<String, String>) -> DeviceEvent {
    let get = |key: &str| props.get(key).cloned().unwrap_or_default();
    let info = DeviceInfo {
        device_type: DeviceType::Android,
        uid: serial.to_string(),
        manufacturer: get("ro.product.manufacturer"),
        model: get("ro.product.model"),
        os_version: get("ro.build.version.release"),
        abi: get("ro.product.cpu.abi"),
        online: true,
        ..DeviceInfo::default()
    };
    DeviceEvent::new(EventKind::InfoUpdated, info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn enrichment_event_maps_well_known_props() {
        let mut props = HashMap::new();
        props.insert("ro.product.manufacturer".to_string(), "Google".to_string());
        props.insert("ro.product.model".to_string(), "Pixel 7".to_string());
        props.insert("ro.build.version.release".to_string(), "14".to_string());
        props.insert("ro.product.cpu.abi".to_string(), "arm64-v8a".to_string());

        let event = enrichment_event("SER", &props);
        assert_eq!(event.kind, EventKind::InfoUpdated);
        assert_eq!(event.info.uid, "SER");
        assert_eq!(event.info.manufacturer, "Google");
        assert_eq!(event.info.model, "Pixel 7");
        assert_eq!(event.info.os_version, "14");
        assert_eq!(event.info.abi, "arm64-v8a");
        assert!(event.info.online);
    }

    #[test]
    fn missing_props_stay_empty_for_monotonic_merge() {
        let event = enrichment_event("SER", &HashMap::new());
        assert_eq!(event.info.manufacturer, "");
        assert_eq!(event.info.model, "");
    }

    #[test]
    fn fetches_props_over_transport_and_shell() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut requests = Vec::new();
            for _ in 0..2 {
                let mut header = [0u8; 4];
                stream.read_exact(&mut header).expect("header");
                let len =
                    usize::from_str_radix(std::str::from_utf8(&header).expect("ascii"), 16)
                        .expect("len");
                let mut body = vec![0u8; len];
                stream.read_exact(&mut body).expect("body");
                requests.push(String::from_utf8(body).expect("utf8"));
                stream.write_all(b"OKAY").expect("okay");
            }
            stream
                .write_all(b"[ro.product.manufacturer]: [Google]\n[ro.product.cpu.abi]: [arm64-v8a]\n")
                .expect("props");
            drop(stream);
            requests
        });

        let props = fetch_getprop(&endpoint, "SER9").expect("props");
        assert_eq!(
            props.get("ro.product.manufacturer").map(String::as_str),
            Some("Google")
        );

        let requests = server.join().expect("server");
        assert_eq!(requests[0], "host:transport:SER9");
        assert_eq!(requests[1], "shell:getprop");
    }
}
