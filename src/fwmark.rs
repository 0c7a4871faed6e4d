/// Permission class carried in a routing mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Network = 1,
    System = 3,
}

/// Socket mark selecting the routing table for outgoing DNS traffic.
///
/// Layout: bits 0-15 network id, bit 16 explicitly selected, bit 17
/// protected from VPN, bits 18-19 permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fwmark {
    pub net_id: u16,
    pub explicitly_selected: bool,
    pub protected_from_vpn: bool,
    pub permission: Permission,
}

impl Fwmark {
    /// Mark used for queries the forwarding helper sends upstream.
    pub fn for_dns_forwarding(net_id: u32) -> Self {
        Self {
            net_id: net_id as u16,
            explicitly_selected: true,
            protected_from_vpn: true,
            permission: Permission::System,
        }
    }

    pub fn value(&self) -> u32 {
        u32::from(self.net_id)
            | (u32::from(self.explicitly_selected) << 16)
            | (u32::from(self.protected_from_vpn) << 17)
            | ((self.permission as u32) << 18)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_forwarding_mark() {
        assert_eq!(Fwmark::for_dns_forwarding(100).value(), 0xf0064);
        assert_eq!(Fwmark::for_dns_forwarding(0).value(), 0xf0000);
    }

    #[test]
    fn test_mark_bits() {
        let mark = Fwmark {
            net_id: 0xffff,
            explicitly_selected: false,
            protected_from_vpn: true,
            permission: Permission::Network,
        };
        assert_eq!(mark.value(), 0x6ffff);
    }
}
