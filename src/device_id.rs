//! Device id generation.
//!
//! An Astarte device id is a 128-bit UUID encoded as unpadded URL-safe
//! base64, which always yields 22 characters.

use alloc::string::String;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::RngCore;
use uuid::{Builder, Uuid};

use crate::error::ConfigError;

/// Length of an encoded device id.
pub const DEVICE_ID_LEN: usize = 22;

/// Encodes a UUID as a device id.
pub fn encode(uuid: &Uuid) -> String {
    URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Decodes a device id back into its UUID.
pub fn decode(device_id: &str) -> Result<Uuid, ConfigError> {
    if device_id.len() != DEVICE_ID_LEN {
        return Err(ConfigError::InvalidDeviceId);
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(device_id)
        .map_err(|_| ConfigError::InvalidDeviceId)?;
    Uuid::from_slice(&bytes).map_err(|_| ConfigError::InvalidDeviceId)
}

/// A random (version 4) device id drawn from `rng`.
///
/// The quality of the id is the quality of the generator: on hardware pass
/// the chip's TRNG, not a seeded PRNG shared between devices.
pub fn generate_random<R: RngCore>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    encode(&Builder::from_random_bytes(bytes).into_uuid())
}

/// A deterministic (version 5) device id.
///
/// The same `namespace` and `name`, typically a hardware identifier such as
/// a MAC address or a serial number, always give the same id.
pub fn generate_deterministic(namespace: &Uuid, name: &[u8]) -> String {
    encode(&Uuid::new_v5(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use uuid::Variant;

    struct StepRng(u8);

    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            let mut bytes = [0u8; 4];
            self.fill_bytes(&mut bytes);
            u32::from_le_bytes(bytes)
        }

        fn next_u64(&mut self) -> u64 {
            let mut bytes = [0u8; 8];
            self.fill_bytes(&mut bytes);
            u64::from_le_bytes(bytes)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.0;
                self.0 = self.0.wrapping_add(17);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn parse(text: &str) -> Uuid {
        Uuid::parse_str(text).unwrap()
    }

    #[test]
    fn encodes_known_uuids() {
        let cases = [
            ("44b35f73-cfbd-43b4-8fef-ca7baea1375f", "RLNfc8-9Q7SP78p7rqE3Xw"),
            ("6f2fd4cb-94a0-41c7-8d27-864c6b13b8c0", "by_Uy5SgQceNJ4ZMaxO4wA"),
            ("0575a569-51eb-575c-afe4-ce7fc03bcdc5", "BXWlaVHrV1yv5M5_wDvNxQ"),
        ];
        for (text, id) in cases {
            assert_eq!(encode(&parse(text)), id);
            assert_eq!(decode(id), Ok(parse(text)));
        }
    }

    #[test]
    fn deterministic_id_matches_known_vector() {
        let namespace = parse("c21fb11c-b6c9-452a-9e86-6075e313d7e2");
        let id = generate_deterministic(&namespace, b"00225588");

        assert_eq!(id, "Y8j7SAKrU_SiVFKVbcu85A");
        assert_eq!(
            decode(&id),
            Ok(parse("63c8fb48-02ab-53f4-a254-52956dcbbce4"))
        );
        assert_eq!(generate_deterministic(&namespace, b"00225588"), id);
        assert_ne!(generate_deterministic(&namespace, b"00225589"), id);
    }

    #[test]
    fn random_id_is_version_4() {
        let mut rng = StepRng(3);
        let first = generate_random(&mut rng);
        let second = generate_random(&mut rng);

        assert_eq!(first.len(), DEVICE_ID_LEN);
        assert_ne!(first, second);
        let parsed = decode(&first).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(parsed.get_variant(), Variant::RFC4122);
    }

    #[test]
    fn generated_ids_are_valid_session_ids() {
        let namespace = parse("c21fb11c-b6c9-452a-9e86-6075e313d7e2");
        let ids = [
            generate_random(&mut StepRng(250)),
            generate_deterministic(&namespace, b"aa:bb:cc:dd:ee:ff"),
        ];
        for id in ids {
            let config = SessionConfig::new("realm", &id).unwrap();
            assert_eq!(config.device_id(), id);
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(decode("short"), Err(ConfigError::InvalidDeviceId));
        assert_eq!(
            decode("RLNfc8+9Q7SP78p7rqE3Xw"),
            Err(ConfigError::InvalidDeviceId)
        );
    }
}
