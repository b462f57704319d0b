mod bridge;
mod dnsmasq;
mod hosts;

pub use bridge::*;
pub use dnsmasq::*;
pub use hosts::*;
