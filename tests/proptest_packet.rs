use proptest::prelude::*;

use dhcp6lease::{Dhcp6Option, Message, MessageType};

const CLIENT_HEADER_SIZE: usize = 4;
const RELAY_HEADER_SIZE: usize = 34;

fn client_header(msg_type: u8) -> Vec<u8> {
    vec![msg_type, 0x12, 0x34, 0x56]
}

fn relay_header(hop_count: u8) -> Vec<u8> {
    let mut packet = vec![0u8; RELAY_HEADER_SIZE];
    packet[0] = 12;
    packet[1] = hop_count;
    packet[2] = 0x20;
    packet[3] = 0x01;
    packet[18] = 0xfe;
    packet[19] = 0x80;
    packet
}

fn push_option(packet: &mut Vec<u8>, code: u16, data: &[u8]) {
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(&(data.len() as u16).to_be_bytes());
    packet.extend_from_slice(data);
}

fn status_option(code: u16, message: &str) -> Vec<u8> {
    let mut data = code.to_be_bytes().to_vec();
    data.extend_from_slice(message.as_bytes());
    let mut option = Vec::new();
    push_option(&mut option, 13, &data);
    option
}

/// Decodes one option body and checks that encoding gives back the same
/// bytes, header included.
fn assert_reencodes(code: u16, data: &[u8]) -> Result<(), TestCaseError> {
    let option = Dhcp6Option::parse(code, data).map_err(|error| TestCaseError::fail(error.to_string()))?;
    let mut expected = Vec::new();
    push_option(&mut expected, code, data);
    prop_assert_eq!(option.encode(), expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = Message::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        msg_type in 1u8..=11,
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = client_header(msg_type);
        packet.extend_from_slice(&options_data);
        let _ = Message::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 1u16..150,
        option_length in any::<u16>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = client_header(1);
        packet.extend_from_slice(&option_code.to_be_bytes());
        packet.extend_from_slice(&option_length.to_be_bytes());
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        let _ = Message::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_ia_contents(
        ia_code in prop::sample::select(vec![3u16, 4, 25]),
        ia_data in prop::collection::vec(any::<u8>(), 0..128)
    ) {
        let mut packet = client_header(3);
        push_option(&mut packet, ia_code, &ia_data);
        let _ = Message::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_relay_message(
        hop_count in 0u8..32,
        inner in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = relay_header(hop_count);
        push_option(&mut packet, 9, &inner);
        if let Ok(Message::Relay(relay)) = Message::parse(&packet) {
            let _ = relay.inner_message();
        }
    }

    #[test]
    fn short_client_headers_are_rejected(
        msg_type in 1u8..=11,
        len in 0usize..CLIENT_HEADER_SIZE
    ) {
        let packet = client_header(msg_type);
        prop_assert!(Message::parse(&packet[..len]).is_err());
    }

    #[test]
    fn short_relay_headers_are_rejected(len in 1usize..RELAY_HEADER_SIZE) {
        let packet = relay_header(0);
        prop_assert!(Message::parse(&packet[..len]).is_err());
    }

    #[test]
    fn relay_hop_count_over_limit_is_rejected(hop_count in 33u8..=255) {
        prop_assert!(Message::parse(&relay_header(hop_count)).is_err());
    }

    #[test]
    fn relay_hop_count_within_limit_is_accepted(hop_count in 0u8..32) {
        let message = Message::parse(&relay_header(hop_count));
        prop_assert!(matches!(message, Ok(Message::Relay(ref relay)) if relay.hop_count == hop_count));
    }

    #[test]
    fn client_identifier_survives_reencoding(
        msg_type in prop::sample::select(vec![1u8, 3, 5, 6, 8, 9]),
        duid in prop::collection::vec(any::<u8>(), 2..64)
    ) {
        let mut packet = client_header(msg_type);
        push_option(&mut packet, 1, &duid);
        let Ok(Message::Client(parsed)) = Message::parse(&packet) else {
            return Err(TestCaseError::fail("client message did not parse"));
        };
        prop_assert_eq!(parsed.client_id(), Some(duid.as_slice()));
        prop_assert_eq!(parsed.encode().ok(), Some(packet));
    }

    #[test]
    fn status_code_reencodes(code: u16, message in "[ -~]{0,64}") {
        let mut data = code.to_be_bytes().to_vec();
        data.extend_from_slice(message.as_bytes());
        assert_reencodes(13, &data)?;
    }

    #[test]
    fn ia_address_reencodes(
        fixed in prop::collection::vec(any::<u8>(), 24),
        status in prop::option::of((any::<u16>(), "[ -~]{0,32}"))
    ) {
        let mut data = fixed;
        if let Some((code, message)) = status {
            data.extend_from_slice(&status_option(code, &message));
        }
        assert_reencodes(5, &data)?;
    }

    #[test]
    fn ia_prefix_reencodes(
        preferred: u32,
        valid: u32,
        prefix_len in 0u8..=128,
        prefix in prop::collection::vec(any::<u8>(), 16),
        status in prop::option::of((any::<u16>(), "[ -~]{0,32}"))
    ) {
        let mut data = preferred.to_be_bytes().to_vec();
        data.extend_from_slice(&valid.to_be_bytes());
        data.push(prefix_len);
        data.extend_from_slice(&prefix);
        if let Some((code, message)) = status {
            data.extend_from_slice(&status_option(code, &message));
        }
        assert_reencodes(26, &data)?;
    }

    #[test]
    fn ia_headers_reencode(
        header in prop::collection::vec(any::<u8>(), 12),
        addresses in prop::collection::vec(prop::collection::vec(any::<u8>(), 24), 0..4)
    ) {
        let mut nested = Vec::new();
        for address in &addresses {
            push_option(&mut nested, 5, address);
        }

        let mut ia_na = header.clone();
        ia_na.extend_from_slice(&nested);
        assert_reencodes(3, &ia_na)?;

        let mut ia_ta = header[..4].to_vec();
        ia_ta.extend_from_slice(&nested);
        assert_reencodes(4, &ia_ta)?;
    }

    #[test]
    fn ia_pd_header_reencodes(
        header in prop::collection::vec(any::<u8>(), 12),
        prefix_len in 0u8..=128,
        prefix in prop::collection::vec(any::<u8>(), 16)
    ) {
        let mut body = vec![0, 0, 0x0e, 0x10, 0, 0, 0x1c, 0x20, prefix_len];
        body.extend_from_slice(&prefix);
        let mut data = header;
        push_option(&mut data, 26, &body);
        assert_reencodes(25, &data)?;
    }
}

#[test]
fn zero_length_status_message_reencodes() {
    let option = Dhcp6Option::parse(13, &[0, 6]).unwrap();
    assert_eq!(option, Dhcp6Option::StatusCode(6, String::new()));
    assert_eq!(option.encode(), vec![0, 13, 0, 2, 0, 6]);
}

#[test]
fn truncated_ia_bodies_are_rejected() {
    for (code, fixed) in [(3u16, 12usize), (4, 4), (5, 24), (25, 12), (26, 25)] {
        for len in 0..fixed {
            assert!(Dhcp6Option::parse(code, &vec![0; len]).is_err(), "code {} len {}", code, len);
        }
    }
}

#[test]
fn unknown_options_are_preserved() {
    let mut packet = client_header(11);
    push_option(&mut packet, 0x1234, &[1, 2, 3]);
    let Ok(Message::Client(parsed)) = Message::parse(&packet) else {
        panic!("client message did not parse");
    };
    assert_eq!(parsed.msg_type, MessageType::InformationRequest);
    assert_eq!(parsed.options, vec![Dhcp6Option::Unknown(0x1234, vec![1, 2, 3])]);
    assert_eq!(parsed.encode().unwrap(), packet);
}
