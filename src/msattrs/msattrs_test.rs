use super::*;

#[test]
fn test_candidate_identifier_round_trip() -> Result<(), stun::Error> {
    let attr = CandidateIdentifierAttr::new("107".to_owned());

    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(attr.clone())])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut got = CandidateIdentifierAttr::default();
    got.get_from(&decoded)?;
    assert_eq!(got, attr);

    Ok(())
}

#[test]
fn test_implementation_version_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(MsImplementationVersionAttr(MS_IMPLEMENTATION_VERSION)),
    ])?;

    let mut got = MsImplementationVersionAttr::default();
    got.get_from(&m)?;
    assert_eq!(got.0, 2);

    Ok(())
}

#[test]
fn test_ms_attributes_are_comprehension_optional() {
    // 0x8000-range attributes must never trigger a 420 from an RFC peer.
    assert!(ATTR_CANDIDATE_IDENTIFIER.optional());
    assert!(ATTR_MS_IMPLEMENTATION_VERSION.optional());
}
