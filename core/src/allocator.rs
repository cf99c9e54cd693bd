/// Port and display number allocation.
///
/// Everything downstream is derived from the VNC port list: web proxy ports
/// default to `vnc_port + WEB_PORT_OFFSET` and display numbers to `1..=N`.
use crate::display::DisplaySlot;
use crate::errors::{ProvisionError, ProvisionResult};
use std::collections::HashSet;

/// Offset from a VNC port to its derived web proxy port (5900 -> 6080).
pub const WEB_PORT_OFFSET: u16 = 180;

/// VNC port used when none are configured.
pub const DEFAULT_VNC_PORT: u16 = 5900;

/// Derive the ordered slot list from the configured lists.
///
/// Deterministic: the same input always yields the same topology, so a full
/// re-provision after a crash reproduces the original layout.
pub fn allocate(
    vnc_ports: Option<&[u16]>,
    web_ports: Option<&[u16]>,
    display_numbers: Option<&[u32]>,
) -> ProvisionResult<Vec<DisplaySlot>> {
    let vnc_ports: Vec<u16> = match vnc_ports {
        Some(ports) if !ports.is_empty() => ports.to_vec(),
        _ => vec![DEFAULT_VNC_PORT],
    };
    let count = vnc_ports.len();

    let web_ports: Vec<u16> = match web_ports {
        Some(ports) if !ports.is_empty() => {
            check_len("web ports", ports.len(), count)?;
            ports.to_vec()
        }
        _ => vnc_ports
            .iter()
            .map(|&vnc| {
                vnc.checked_add(WEB_PORT_OFFSET).ok_or_else(|| {
                    ProvisionError::Configuration(format!(
                        "VNC port {} leaves no room for a derived web port",
                        vnc
                    ))
                })
            })
            .collect::<ProvisionResult<_>>()?,
    };

    let display_numbers: Vec<u32> = match display_numbers {
        Some(numbers) if !numbers.is_empty() => {
            check_len("display numbers", numbers.len(), count)?;
            numbers.to_vec()
        }
        _ => (1..=count as u32).collect(),
    };

    ensure_unique("VNC port", &vnc_ports)?;
    ensure_unique("web port", &web_ports)?;
    ensure_unique("display number", &display_numbers)?;

    if let Some(clash) = web_ports.iter().find(|p| vnc_ports.contains(p)) {
        return Err(ProvisionError::Configuration(format!(
            "port {} is configured as both a VNC and a web port",
            clash
        )));
    }

    Ok(display_numbers
        .into_iter()
        .zip(vnc_ports)
        .zip(web_ports)
        .map(|((display, vnc), web)| DisplaySlot::new(display, vnc, web))
        .collect())
}

fn check_len(what: &str, got: usize, expected: usize) -> ProvisionResult<()> {
    if got != expected {
        return Err(ProvisionError::Configuration(format!(
            "{} {} configured but {} VNC ports; the lists must have equal length",
            got, what, expected
        )));
    }
    Ok(())
}

fn ensure_unique<T>(what: &str, values: &[T]) -> ProvisionResult<()>
where
    T: std::hash::Hash + Eq + std::fmt::Display,
{
    let mut seen = HashSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(ProvisionError::Configuration(format!(
                "duplicate {} {}",
                what, value
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derives_web_ports_and_displays() {
        let slots = allocate(Some(&[5900, 5901]), None, None).unwrap();
        let triples: Vec<_> = slots
            .iter()
            .map(|s| (s.display_number, s.vnc_port, s.web_port))
            .collect();
        assert_eq!(triples, vec![(1, 5900, 6080), (2, 5901, 6081)]);
    }

    #[test]
    fn test_defaults_to_single_display() {
        let slots = allocate(None, None, None).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].display_number, 1);
        assert_eq!(slots[0].vnc_port, 5900);
        assert_eq!(slots[0].web_port, 6080);
    }

    #[test]
    fn test_explicit_lists_are_used_verbatim() {
        let slots = allocate(Some(&[5910, 5920]), Some(&[7000, 7001]), Some(&[10, 20])).unwrap();
        assert_eq!(slots[0].display_number, 10);
        assert_eq!(slots[1].web_port, 7001);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let err = allocate(Some(&[5900, 5901]), Some(&[6080]), None).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));

        let err = allocate(Some(&[5900]), None, Some(&[1, 2])).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(allocate(Some(&[5900, 5900]), None, None).is_err());
        assert!(allocate(Some(&[5900, 5901]), None, Some(&[1, 1])).is_err());
        // 5900 + 180 == 6080, which is also listed as a VNC port
        assert!(allocate(Some(&[5900, 6080]), None, None).is_err());
    }

    #[test]
    fn test_overflowing_web_port_rejected() {
        assert!(allocate(Some(&[65500]), None, None).is_err());
    }

    #[test]
    fn test_allocation_is_deterministic_and_unique() {
        for n in 1..=16u16 {
            let vnc: Vec<u16> = (0..n).map(|i| 5900 + i).collect();
            let first = allocate(Some(&vnc), None, None).unwrap();
            let second = allocate(Some(&vnc), None, None).unwrap();
            assert_eq!(first, second);

            let mut ports: Vec<u16> = first
                .iter()
                .flat_map(|s| [s.vnc_port, s.web_port])
                .collect();
            ports.sort_unstable();
            ports.dedup();
            assert_eq!(ports.len(), 2 * n as usize);
        }
    }
}
