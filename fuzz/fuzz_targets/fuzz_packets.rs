#![no_main]

use brokerlink::core::serialization::WireFormat;
use brokerlink::extension::endpoint::packets::{
    EndpointInvokedPacket, EndpointRegisterPacket, EndpointResponsePacket,
};
use brokerlink::extension::registry::packets::{RegistryPacket, RegistryRegisterPacket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz the binary extension packet decoders
    let _ = EndpointRegisterPacket::from_bytes(data);
    let _ = EndpointInvokedPacket::from_bytes(data);
    let _ = EndpointResponsePacket::from_bytes(data);
    let _ = RegistryPacket::from_bytes(data);
    let _ = RegistryRegisterPacket::from_bytes(data);
});
