//! Apply a channel table to a completed frame's payload, and the reverse.
//!
//! Values travel as `f64` keyed by the channel's dotted field name. Dynamic arrays expand to
//! `<name>_0 .. <name>_{n-1}`; their element count is the number of consecutive keys present.

use crate::bits::{decode_value, encode_value, BitReader, BitWriter};
use crate::frame::{UavcanError, UavcanFrame};
use crate::rules::UavcanChannel;
use std::collections::HashMap;

fn too_short(reader: &BitReader<'_>, bits: u32) -> UavcanError {
    UavcanError::PayloadTooShort {
        needed: reader.offset() + bits as usize,
        available: reader.offset() + reader.remaining_bits(),
    }
}

fn element_name(name: &str, index: usize) -> String {
    format!("{}_{}", name, index)
}

/// Decode `frame.payload` according to `channels`. Padding channels only advance the offset;
/// trailing payload bytes beyond the last channel are ignored.
pub fn parse_frame(frame: &UavcanFrame, channels: &[UavcanChannel]) -> Result<HashMap<String, f64>, UavcanError> {
    let mut reader = BitReader::new(&frame.payload);
    let mut values = HashMap::with_capacity(channels.len());
    for channel in channels {
        if channel.is_void() {
            reader.skip(channel.size).ok_or_else(|| too_short(&reader, channel.size))?;
            continue;
        }
        if channel.is_dynamic {
            let count = reader
                .read(channel.size_prefix_bits)
                .ok_or_else(|| too_short(&reader, channel.size_prefix_bits))? as usize;
            if count > channel.max_count() as usize {
                return Err(UavcanError::ArrayTooLong {
                    name: channel.field_name.clone(),
                    max: channel.max_count(),
                    count,
                });
            }
            for i in 0..count {
                let raw = reader.read(channel.size).ok_or_else(|| too_short(&reader, channel.size))?;
                values.insert(
                    element_name(&channel.field_name, i),
                    decode_value(channel.base_type, channel.size, raw),
                );
            }
            continue;
        }
        let raw = reader.read(channel.size).ok_or_else(|| too_short(&reader, channel.size))?;
        values.insert(channel.field_name.clone(), decode_value(channel.base_type, channel.size, raw));
    }
    Ok(values)
}

/// Encode named values into a copy of `template` whose payload is replaced.
pub fn serialize_frame(
    channels: &[UavcanChannel],
    values: &HashMap<String, f64>,
    template: &UavcanFrame,
) -> Result<UavcanFrame, UavcanError> {
    let mut writer = BitWriter::new();
    for channel in channels {
        if channel.is_void() {
            writer.skip(channel.size);
        } else if channel.is_dynamic {
            let elements: Vec<f64> = (0..)
                .map_while(|i| values.get(&element_name(&channel.field_name, i)).copied())
                .collect();
            write_dynamic(&mut writer, channel, &elements)?;
        } else {
            let value = values
                .get(&channel.field_name)
                .ok_or_else(|| UavcanError::MissingValue(channel.field_name.clone()))?;
            writer.write(channel.size, encode_value(channel.base_type, channel.size, *value));
        }
    }
    Ok(with_payload(template, writer.into_bytes()))
}

/// Encode values given in channel order. A dynamic array consumes its element count
/// followed by that many elements.
pub fn serialize_frame_values(
    channels: &[UavcanChannel],
    values: &[f64],
    template: &UavcanFrame,
) -> Result<UavcanFrame, UavcanError> {
    let mut writer = BitWriter::new();
    let mut it = values.iter().copied();
    let mut used = 0usize;
    let mut next = |used: &mut usize| {
        let v = it.next().ok_or(UavcanError::NotEnoughValues(*used))?;
        *used += 1;
        Ok::<f64, UavcanError>(v)
    };
    for channel in channels {
        if channel.is_void() {
            writer.skip(channel.size);
        } else if channel.is_dynamic {
            let count = next(&mut used)?.max(0.0) as usize;
            let elements = (0..count).map(|_| next(&mut used)).collect::<Result<Vec<_>, _>>()?;
            write_dynamic(&mut writer, channel, &elements)?;
        } else {
            let value = next(&mut used)?;
            writer.write(channel.size, encode_value(channel.base_type, channel.size, value));
        }
    }
    Ok(with_payload(template, writer.into_bytes()))
}

fn write_dynamic(writer: &mut BitWriter, channel: &UavcanChannel, elements: &[f64]) -> Result<(), UavcanError> {
    // the count must fit the prefix as well as the declared max
    if elements.len() > channel.max_count() as usize {
        return Err(UavcanError::ArrayTooLong {
            name: channel.field_name.clone(),
            max: channel.max_count(),
            count: elements.len(),
        });
    }
    writer.write(channel.size_prefix_bits, elements.len() as u64);
    for value in elements {
        writer.write(channel.size, encode_value(channel.base_type, channel.size, *value));
    }
    Ok(())
}

fn with_payload(template: &UavcanFrame, payload: Vec<u8>) -> UavcanFrame {
    UavcanFrame { payload, ..template.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseType;

    fn pitot_channels() -> Vec<UavcanChannel> {
        vec![
            UavcanChannel::scalar(BaseType::Float, 32, "pressure_delta"),
            UavcanChannel::scalar(BaseType::SignedInt, 8, "error_bf"),
        ]
    }

    #[test]
    fn serialize_pitot_tube_values() {
        let template = UavcanFrame::new_message(413, 1, 1);
        let frame = serialize_frame_values(&pitot_channels(), &[128.64, 1.0], &template).expect("serialize");
        assert_eq!(frame.payload, vec![215, 163, 0, 67, 1]);
        assert_eq!(frame.subject_id, 413);

        let named: HashMap<String, f64> =
            [("pressure_delta".to_string(), 128.64), ("error_bf".to_string(), 1.0)].into_iter().collect();
        let frame = serialize_frame(&pitot_channels(), &named, &template).expect("serialize");
        assert_eq!(frame.payload, vec![215, 163, 0, 67, 1]);
    }

    #[test]
    fn parse_received_pitot_tube() {
        let frame = UavcanFrame::decode(73506175, &[0, 64, 154, 68, 0, 224], 0).expect("decode");
        let channels = vec![
            UavcanChannel::scalar(BaseType::Float, 32, "TestDsdl.PitotTube.pressure_delta"),
            UavcanChannel::scalar(BaseType::UnsignedInt, 4, "TestDsdl.PitotTube.error_bf"),
        ];
        let values = parse_frame(&frame, &channels).expect("parse");
        assert_eq!(values["TestDsdl.PitotTube.pressure_delta"], 1234.0);
        assert_eq!(values["TestDsdl.PitotTube.error_bf"], 0.0);
    }

    #[test]
    fn padding_signed_and_bool() {
        let channels = vec![
            UavcanChannel::scalar(BaseType::SignedInt, 3, "a"),
            UavcanChannel::padding(5),
            UavcanChannel::scalar(BaseType::Boolean, 1, "flag"),
            UavcanChannel::scalar(BaseType::Float, 16, "half"),
        ];
        let template = UavcanFrame::new_message(1, 1, 0);
        let frame = serialize_frame_values(&channels, &[-3.0, 0.7, -2.5], &template).expect("serialize");
        assert_eq!(frame.payload[0], 0b101);
        let values = parse_frame(&frame, &channels).expect("parse");
        assert_eq!(values.len(), 3);
        assert_eq!(values["a"], -3.0);
        assert_eq!(values["flag"], 1.0);
        assert_eq!(values["half"], -2.5);
    }

    #[test]
    fn dynamic_arrays() {
        let channels = vec![
            UavcanChannel::dynamic_array(BaseType::UnsignedInt, 8, "bytes", 10),
            UavcanChannel::scalar(BaseType::UnsignedInt, 4, "tail"),
        ];
        let template = UavcanFrame::new_message(1, 1, 0);
        let frame = serialize_frame_values(&channels, &[3.0, 7.0, 8.0, 9.0, 15.0], &template).expect("serialize");
        let values = parse_frame(&frame, &channels).expect("parse");
        assert_eq!(values["bytes_0"], 7.0);
        assert_eq!(values["bytes_2"], 9.0);
        assert!(!values.contains_key("bytes_3"));
        assert_eq!(values["tail"], 15.0);

        let named: HashMap<String, f64> = values.clone();
        let again = serialize_frame(&channels, &named, &template).expect("serialize");
        assert_eq!(again.payload, frame.payload);
    }

    #[test]
    fn dynamic_array_filled_to_max() {
        let channels = vec![
            UavcanChannel::dynamic_array(BaseType::UnsignedInt, 8, "bytes", 10),
            UavcanChannel::scalar(BaseType::UnsignedInt, 8, "tail"),
        ];
        let template = UavcanFrame::new_message(1, 1, 0);
        let mut values = vec![10.0];
        values.extend((1..=10u32).map(|v| f64::from(v * 11)));
        values.push(42.0);
        let frame = serialize_frame_values(&channels, &values, &template).expect("serialize");
        // 4-bit count, 80 bits of elements, 8-bit tail
        assert_eq!(frame.payload.len(), 12);
        let parsed = parse_frame(&frame, &channels).expect("parse");
        assert_eq!(parsed.len(), 11);
        assert_eq!(parsed["bytes_0"], 11.0);
        assert_eq!(parsed["bytes_9"], 110.0);
        assert_eq!(parsed["tail"], 42.0);
    }

    #[test]
    fn dynamic_count_must_fit_the_prefix() {
        let template = UavcanFrame::new_message(1, 1, 0);
        let eight = vec![
            UavcanChannel::dynamic_array(BaseType::UnsignedInt, 8, "b", 8),
            UavcanChannel::scalar(BaseType::UnsignedInt, 8, "tail"),
        ];
        let mut values = vec![8.0];
        values.extend((1..=8u32).map(f64::from));
        values.push(42.0);
        assert_eq!(
            serialize_frame_values(&eight, &values, &template),
            Err(UavcanError::ArrayTooLong { name: "b".to_string(), max: 7, count: 8 })
        );
        let named: HashMap<String, f64> = (0..8)
            .map(|i| (format!("b_{}", i), 1.0))
            .chain([("tail".to_string(), 42.0)])
            .collect();
        assert!(matches!(
            serialize_frame(&eight, &named, &template),
            Err(UavcanError::ArrayTooLong { count: 8, .. })
        ));

        // seven elements fill the 3-bit prefix
        let frame = serialize_frame_values(&eight, &[7.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 42.0], &template)
            .expect("serialize");
        let parsed = parse_frame(&frame, &eight).expect("parse");
        assert_eq!(parsed["b_6"], 7.0);
        assert_eq!(parsed["tail"], 42.0);

        let one = vec![
            UavcanChannel::dynamic_array(BaseType::UnsignedInt, 8, "b", 1),
            UavcanChannel::scalar(BaseType::UnsignedInt, 8, "tail"),
        ];
        assert_eq!(
            serialize_frame_values(&one, &[1.0, 99.0, 42.0], &template),
            Err(UavcanError::ArrayTooLong { name: "b".to_string(), max: 0, count: 1 })
        );
        let frame = serialize_frame_values(&one, &[0.0, 42.0], &template).expect("serialize");
        assert_eq!(frame.payload, vec![42]);
        let parsed = parse_frame(&frame, &one).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["tail"], 42.0);
    }

    #[test]
    fn errors() {
        let template = UavcanFrame::new_message(1, 1, 0);
        assert_eq!(
            serialize_frame_values(&pitot_channels(), &[1.0], &template),
            Err(UavcanError::NotEnoughValues(1))
        );
        assert_eq!(
            serialize_frame(&pitot_channels(), &HashMap::new(), &template),
            Err(UavcanError::MissingValue("pressure_delta".to_string()))
        );
        let short = UavcanFrame { payload: vec![1, 2], ..template.clone() };
        assert_eq!(
            parse_frame(&short, &pitot_channels()),
            Err(UavcanError::PayloadTooShort { needed: 32, available: 16 })
        );
        let dynamic = vec![UavcanChannel::dynamic_array(BaseType::UnsignedInt, 8, "b", 2)];
        assert!(matches!(
            serialize_frame_values(&dynamic, &[3.0, 1.0, 2.0, 3.0], &template),
            Err(UavcanError::ArrayTooLong { count: 3, .. })
        ));
    }
}
