//! Terminal escape stripping so signatures match on visible text only.

/// Strip ANSI escape sequences from `input`, decoding the rest lossily.
///
/// CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ESC \`) and two-byte escapes
/// are removed. Invalid UTF-8 becomes U+FFFD rather than failing, so a
/// corrupt chunk never stalls the stream.
pub fn strip_ansi(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        if input[i] != 0x1B {
            out.push(input[i]);
            i += 1;
            continue;
        }

        i += 1;
        let Some(&next) = input.get(i) else {
            break;
        };
        match next {
            b'[' => {
                i += 1;
                while i < input.len() && (0x20..=0x3F).contains(&input[i]) {
                    i += 1;
                }
                if i < input.len() && (0x40..=0x7E).contains(&input[i]) {
                    i += 1;
                }
            }
            b']' => {
                i += 1;
                while i < input.len() {
                    if input[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if input[i] == 0x1B && input.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            0x20..=0x7E => i += 1,
            _ => {}
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
