use super::*;

#[test]
fn test_controlling_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlling(4321))])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut c = AttrControlling::default();
    c.get_from(&decoded)?;
    assert_eq!(c.0, 4321);

    Ok(())
}

#[test]
fn test_controlled_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlled(1234))])?;

    let mut c = AttrControlled::default();
    c.get_from(&m)?;
    assert_eq!(c.0, 1234);

    Ok(())
}

#[test]
fn test_attr_control_detects_role() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(AttrControl {
            role: Role::Controlled,
            tie_breaker: 7,
        }),
    ])?;

    let observed = AttrControl::from_message(&m).expect("attribute present");
    assert_eq!(observed.role, Role::Controlled);
    assert_eq!(observed.tie_breaker, 7);

    let empty = Message::new();
    assert!(AttrControl::from_message(&empty).is_none());

    Ok(())
}

#[test]
fn test_tie_breaker_bad_size() {
    let mut m = Message::new();
    m.add(ATTR_ICE_CONTROLLING, &[0; 3]);
    let mut c = AttrControlling::default();
    assert!(c.get_from(&m).is_err());
}
