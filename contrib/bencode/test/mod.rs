use riptide_bencode::{Bencode, DecodeError, Value};

const TORRENT_LIKE: &[u8] =
    b"d8:announce20:http://tracker/young4:infod6:lengthi49152e4:name5:f.bin12:piece \
      lengthi16384e6:pieces0:ee";

#[test]
fn decodes_the_four_value_kinds() {
    let value = Value::decode(b"d3:inti-42e4:listl1:a1:be3:str5:helloe").unwrap();

    assert_eq!(value.lookup(b"int").unwrap().as_int(), Some(-42));
    assert_eq!(value.lookup(b"str").unwrap().as_str(), Some("hello"));

    let list = value.lookup(b"list").unwrap().as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].as_bytes(), Some(&b"a"[..]));
}

#[test]
fn raw_bytes_span_the_exact_encoding_of_nested_values() {
    let value = Value::decode(TORRENT_LIKE).unwrap();

    let info = value.lookup(b"info").unwrap();
    assert_eq!(info.raw_bytes()[0], b'd');
    assert_eq!(*info.raw_bytes().last().unwrap(), b'e');

    // Re-decoding the span yields the same value.
    assert_eq!(&Value::decode(info.raw_bytes()).unwrap(), info);
}

#[test]
fn decode_prefix_reports_consumed_length() {
    let mut buffer = b"i7e".to_vec();
    buffer.extend_from_slice(b"4:rest");

    let (value, consumed) = Value::decode_prefix(&buffer).unwrap();
    assert_eq!(value.as_int(), Some(7));
    assert_eq!(consumed, 3);
}

#[test]
fn canonical_buffers_round_trip_byte_for_byte() {
    for canonical in [
        &b"i0e"[..],
        &b"i-31e"[..],
        &b"0:"[..],
        &b"4:spam"[..],
        &b"le"[..],
        &b"li1ei2ee"[..],
        &b"de"[..],
        TORRENT_LIKE,
    ] {
        let value = Value::decode(canonical).unwrap();
        assert_eq!(value.to_owned_value().encode(), canonical);
    }
}

#[test]
fn owned_values_round_trip_through_decode() {
    let original = Bencode::dict([
        ("alpha", Bencode::Int(1)),
        ("beta", Bencode::bytes(vec![0u8, 255, 13])),
        ("gamma", Bencode::List(vec![Bencode::from("x"), Bencode::Int(-9)])),
    ]);

    let encoded = original.encode();
    let decoded = Value::decode(&encoded).unwrap();

    assert_eq!(decoded.to_owned_value(), original);
}

#[test]
fn dict_keys_are_emitted_sorted_regardless_of_insertion_order() {
    let out = Bencode::dict([("zz", Bencode::Int(1)), ("aa", Bencode::Int(2))]).encode();
    assert_eq!(&out, b"d2:aai2e2:zzi1ee");
}

#[test]
fn rejects_malformed_integers() {
    assert_eq!(
        Value::decode(b"i-0e"),
        Err(DecodeError::NegativeZero { pos: 0 })
    );
    assert_eq!(
        Value::decode(b"i03e"),
        Err(DecodeError::LeadingZeros { pos: 0 })
    );
    assert_eq!(Value::decode(b"i-xe"), Err(DecodeError::InvalidInt { pos: 0 }));
    assert_eq!(Value::decode(b"ie"), Err(DecodeError::InvalidInt { pos: 0 }));
    assert_eq!(
        Value::decode(b"i12"),
        Err(DecodeError::UnterminatedInt { pos: 0 })
    );
}

#[test]
fn rejects_malformed_byte_strings() {
    assert_eq!(
        Value::decode(b"5:spam"),
        Err(DecodeError::LengthOverflow { pos: 0 })
    );
    assert_eq!(Value::decode(b"2x:ab"), Err(DecodeError::InvalidInt { pos: 0 }));
}

#[test]
fn rejects_unsorted_and_duplicate_dict_keys() {
    assert!(matches!(
        Value::decode(b"d1:bi1e1:ai2ee"),
        Err(DecodeError::UnsortedKey { .. })
    ));
    assert!(matches!(
        Value::decode(b"d1:ai1e1:ai2ee"),
        Err(DecodeError::DuplicateKey { .. })
    ));
}

#[test]
fn rejects_unterminated_containers_and_trailing_bytes() {
    assert_eq!(
        Value::decode(b"li1e"),
        Err(DecodeError::UnterminatedContainer { pos: 0 })
    );
    assert_eq!(
        Value::decode(b"d4:spami1e"),
        Err(DecodeError::UnterminatedContainer { pos: 0 })
    );
    assert_eq!(
        Value::decode(b"i1ei2e"),
        Err(DecodeError::TrailingBytes { pos: 3, trailing: 3 })
    );
}

#[test]
fn rejects_runaway_nesting() {
    let mut deep = vec![b'l'; 64];
    deep.extend(std::iter::repeat(b'e').take(64));

    assert!(matches!(Value::decode(&deep), Err(DecodeError::TooDeep { .. })));
}
