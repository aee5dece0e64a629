//! DHCPv6 AddressPool and PDPool (§4.6), kept apart from `v4::pool` since the
//! v6 pool enumerates 128-bit addresses rather than `u32` offsets and the
//! PDPool has no v4 equivalent.

pub mod v6;
