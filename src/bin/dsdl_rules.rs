//! Parse a DSDL tree and print the generated serialization rules, optionally decoding one frame.
//!
//! Usage:
//!   dsdl_rules [OPTIONS] ROOT [FILTER]
//!
//! Prints every message and service whose full name contains FILTER, one channel per line.
//!
//! Options:
//!   --frame CAN_ID PAYLOAD  Decode one single-frame transfer (hex CAN id, hex payload including
//!                           the tail byte) with the rules and print its values instead.
//!
//! Log verbosity follows RUST_LOG (default: warn).

use anyhow::{bail, Context};
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;
use uavcan_dsdl::{SerializationRules, UavcanChannel, UavcanReceiver};

fn describe(channel: &UavcanChannel) -> String {
    if channel.is_void() {
        return format!("void{}", channel.size);
    }
    let base = format!("{}{} {}", channel.base_type.name(), channel.size, channel.field_name);
    if channel.is_dynamic {
        format!("{} [<={}] (+{} bit count)", base, channel.array_size, channel.size_prefix_bits)
    } else {
        base
    }
}

fn print_channels(channels: &[UavcanChannel]) {
    for c in channels {
        println!("    {}", describe(c));
    }
}

fn total_bits(channels: &[UavcanChannel]) -> u32 {
    channels.iter().map(UavcanChannel::max_bit_length).fold(0, u32::saturating_add)
}

fn parse_hex_bytes(text: &str) -> anyhow::Result<Vec<u8>> {
    let text: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if let Some(bad) = text.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("payload hex contains {:?}, which is not a hex digit", bad);
    }
    if text.len() % 2 != 0 {
        bail!("payload hex has an odd number of digits");
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).with_context(|| format!("bad hex byte {:?}", &text[i..i + 2])))
        .collect()
}

fn parse_hex_u32(text: &str) -> anyhow::Result<u32> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("bad CAN id {:?}", text))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let frame = if let Some(pos) = args.iter().position(|a| a == "--frame") {
        if args.len() < pos + 3 {
            bail!("--frame needs a CAN id and a payload");
        }
        let parts: Vec<String> = args.drain(pos..pos + 3).collect();
        Some((parse_hex_u32(&parts[1])?, parse_hex_bytes(&parts[2])?))
    } else {
        None
    };
    let Some(root) = args.first().cloned() else {
        eprintln!("usage: dsdl_rules [--frame CAN_ID PAYLOAD] ROOT [FILTER]");
        std::process::exit(2);
    };
    let filter = args.get(1).cloned().unwrap_or_default();

    let rules = SerializationRules::load(&root).with_context(|| format!("loading {}", root))?;

    if let Some((can_id, payload)) = frame {
        let receiver = UavcanReceiver::new(rules);
        match receiver.on_frame_received(can_id, &payload, 0)? {
            Some(transfer) => {
                println!("{} (id {}, source {})", transfer.name, transfer.subject_id, transfer.source_node_id);
                let sorted: BTreeMap<_, _> = transfer.values.into_iter().collect();
                for (name, value) in sorted {
                    println!("    {} = {}", name, value);
                }
            }
            None => eprintln!("frame produced no transfer (multi-frame part or unknown id)"),
        }
        return Ok(());
    }

    for message in rules.messages().filter(|m| m.name.contains(&filter)) {
        println!("message {} {} ({} bits max)", message.subject_id, message.name, total_bits(&message.channels));
        print_channels(&message.channels);
    }
    for service in rules.services().filter(|s| s.name.contains(&filter)) {
        println!("service {} {}", service.subject_id, service.name);
        println!("  request ({} bits max)", total_bits(&service.request));
        print_channels(&service.request);
        println!("  response ({} bits max)", total_bits(&service.response));
        print_channels(&service.response);
    }
    Ok(())
}
