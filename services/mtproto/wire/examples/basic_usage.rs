//! Basic usage example for the MTProto wire layer.

use bytes::{Bytes, BytesMut};
use mtproto_wire::{
    decode_plain, encode_plain, msg_id_at, ContainerItem, PacketDecoder, PacketEncoder, ReqPq,
    ServiceMessage,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== MTProto Wire Example ===\n");

    // 1. Build an unencrypted req_pq and frame it
    println!("1. Framing an unencrypted req_pq...");
    let unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_millis() as u64;
    let request = ReqPq { nonce: [0x42; 16] }.to_bytes();
    let envelope = encode_plain(msg_id_at(unix_ms), &request);

    let mut encoder = PacketEncoder::new();
    let packet = encoder.encode(&envelope);
    println!("   Packet size: {} bytes", packet.len());

    // 2. Decode it back from a stream split in two halves
    println!("\n2. Decoding from partial input...");
    let mut decoder = PacketDecoder::new();
    let mut buf = BytesMut::new();
    let (first, second) = packet.split_at(packet.len() / 2);

    buf.extend_from_slice(first);
    println!("   After first half: {:?}", decoder.decode(&mut buf)?.map(|_| ()));

    buf.extend_from_slice(second);
    if let Some(decoded) = decoder.decode(&mut buf)? {
        let plain = decode_plain(&decoded.payload)?;
        println!("   Packet number: {}", decoded.packet_number);
        println!("   Message ID: 0x{:016X}", plain.msg_id);
        println!("   Nonce echoed: {:?}", ReqPq::parse(&plain.body)?.nonce);
    }

    // 3. Build a container with an ack and a ping
    println!("\n3. Building a service container...");
    let ack = ServiceMessage::MsgsAck {
        msg_ids: vec![0x5e0b800e00000001],
    };
    let ping = ServiceMessage::PingDelayDisconnect {
        ping_id: 7,
        disconnect_delay: 75,
    };
    let container = ServiceMessage::Container(vec![
        ContainerItem {
            msg_id: msg_id_at(unix_ms + 1),
            seq_no: 0,
            body: ack.to_bytes(),
        },
        ContainerItem {
            msg_id: msg_id_at(unix_ms + 2),
            seq_no: 1,
            body: ping.to_bytes(),
        },
    ]);
    let bytes: Bytes = container.to_bytes();
    println!("   Container size: {} bytes", bytes.len());

    if let ServiceMessage::Container(items) = ServiceMessage::parse(&bytes)? {
        for item in items {
            println!(
                "   seq {} -> {:?}",
                item.seq_no,
                ServiceMessage::parse(&item.body)?
            );
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
