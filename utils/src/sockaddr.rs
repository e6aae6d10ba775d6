use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A socket address, distinct from `std::net::SocketAddr` so that callers are not forced
/// to match on the `V4`/`V6` variants when all they want is the address and port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddr {
	pub addr: IpAddr,
	pub port: u16,
}

impl SocketAddr {
	pub fn new(addr: IpAddr, port: u16) -> Self {
		Self { addr, port }
	}

	pub fn is_ipv4(&self) -> bool {
		matches!(self.addr, IpAddr::V4(_))
	}

	pub fn is_ipv6(&self) -> bool {
		matches!(self.addr, IpAddr::V6(_))
	}
}

impl fmt::Display for SocketAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.addr {
			IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
			IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
		}
	}
}

impl fmt::Debug for SocketAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl From<std::net::SocketAddr> for SocketAddr {
	fn from(value: std::net::SocketAddr) -> Self {
		Self { addr: value.ip(), port: value.port() }
	}
}

impl From<SocketAddr> for std::net::SocketAddr {
	fn from(value: SocketAddr) -> Self {
		std::net::SocketAddr::new(value.addr, value.port)
	}
}

impl From<(Ipv4Addr, u16)> for SocketAddr {
	fn from((addr, port): (Ipv4Addr, u16)) -> Self {
		Self { addr: IpAddr::V4(addr), port }
	}
}

impl From<(Ipv6Addr, u16)> for SocketAddr {
	fn from((addr, port): (Ipv6Addr, u16)) -> Self {
		Self { addr: IpAddr::V6(addr), port }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn formats_v4() {
		let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 53);
		assert_eq!(addr.to_string(), "127.0.0.1:53");
	}

	#[test]
	fn formats_v6() {
		let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53);
		assert_eq!(addr.to_string(), "[::1]:53");
	}

	#[test]
	fn roundtrips_through_std() {
		let std_addr: std::net::SocketAddr = "192.0.2.1:8053".parse().unwrap();
		let addr: SocketAddr = std_addr.into();
		assert_eq!(std::net::SocketAddr::from(addr), std_addr);
	}
}
