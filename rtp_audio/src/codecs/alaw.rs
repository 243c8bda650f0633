// ITU-T G.711 A-law, even bits inverted on the wire.

pub fn encode_sample(s: i16) -> u8 {
    let (sign, magnitude) = if s >= 0 {
        (0x80u8, (s as i32) >> 3)
    } else {
        (0x00u8, (-(s as i32) - 1) >> 3)
    };

    let code = if magnitude < 32 {
        (magnitude >> 1) as u8
    } else {
        let mut segment = 1u8;
        while segment < 7 && magnitude >= (32 << segment) {
            segment += 1;
        }
        let mantissa = ((magnitude >> segment) & 0x0F) as u8;
        (segment << 4) | mantissa
    };

    (sign | code) ^ 0x55
}

pub fn decode_sample(b: u8) -> i16 {
    let byte = b ^ 0x55;
    let segment = (byte >> 4) & 0x07;
    let mantissa = (byte & 0x0F) as i32;

    let magnitude = if segment == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (segment - 1)
    };
    if byte & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}
