//! Datapath identifier helpers.

/// 64-bit OpenFlow datapath id
pub type Dpid = u64;

/// Render a DPID in the canonical colon-separated hex form.
pub fn dpid_to_string(dpid: Dpid) -> String {
    let b = dpid.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

/// Parse a colon-separated hex DPID.
pub fn dpid_from_string(value: &str) -> crate::error::Result<Dpid> {
    let mut out: u64 = 0;
    let mut count = 0;
    for part in value.split(':') {
        let byte = u8::from_str_radix(part, 16)
            .map_err(|_| config_error!("invalid DPID component: {}", part))?;
        out = (out << 8) | byte as u64;
        count += 1;
    }
    if count != 8 {
        return Err(config_error!("DPID must have 8 octets: {}", value));
    }
    Ok(out)
}
