//! 클라이언트 인증 처리
//!
//! 비밀번호는 평문 대신 handshake seed로 scramble하여 전송한다.

/// 비밀번호 scramble 생성
///
/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
pub fn scramble_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(seed + SHA1(SHA1(password)))
    let mut combined = seed.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// 서버 측 검증: 저장된 SHA1(SHA1(password))로 scramble을 확인
pub fn verify_scramble(scrambled: &[u8], seed: &[u8], password_double_sha1: &[u8]) -> bool {
    if scrambled.len() != 20 {
        return false;
    }

    let mut combined = seed.to_vec();
    combined.extend_from_slice(password_double_sha1);
    let stage3 = sha1(&combined);

    // scramble XOR stage3 = SHA1(password)
    let stage1: Vec<u8> = scrambled.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect();
    sha1(&stage1) == password_double_sha1
}

/// SHA1(SHA1(password))
pub fn double_sha1(password: &str) -> Vec<u8> {
    sha1(&sha1(password.as_bytes()))
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scramble_empty_password() {
        let response = scramble_password("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
    }

    #[test]
    fn test_scramble_length() {
        let seed = vec![0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];
        let response = scramble_password("password", &seed);
        assert_eq!(response.len(), 20); // SHA1 produces 20 bytes
    }

    #[test]
    fn test_verify_scramble() {
        let seed = b"0123456789abcdefghij";
        let scrambled = scramble_password("canal", seed);
        assert!(verify_scramble(&scrambled, seed, &double_sha1("canal")));
        assert!(!verify_scramble(&scrambled, seed, &double_sha1("other")));
        assert!(!verify_scramble(&scrambled, b"another-seed", &double_sha1("canal")));
    }
}
