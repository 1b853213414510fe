//! Rendering of channel format templates.
//!
//! Channel output formats are printf-compatible template strings. Three
//! recognitions apply to a decoded software message:
//!
//!  - a template containing `%f` reinterprets the 32-bit payload as an
//!    IEEE-754 single (an explicit bit cast of the little-endian value);
//!  - a template containing `%c` is rendered once per payload byte,
//!    least-significant byte first;
//!  - any other template is rendered once, with the value repeated so
//!    that up to four positional conversions are satisfied.

/// Renders `template` for one decoded software message of `len` payload
/// bytes holding `value`.
pub fn render(template: &str, value: u32, len: u8) -> String {
    if template.contains("%c") {
        let mut out = String::new();
        for i in 0..len.min(4) {
            let byte = (value >> (8 * i)) & 0xFF;
            out.push_str(&render_once(template, &[byte; 4]));
        }
        out
    } else {
        render_once(template, &[value; 4])
    }
}

/// Renders `template` once against up to four positional arguments.
fn render_once(template: &str, args: &[u32; 4]) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            if c == '\\' {
                match chars.peek() {
                    Some('n') => {
                        chars.next();
                        out.push('\n');
                        continue;
                    }
                    Some('t') => {
                        chars.next();
                        out.push('\t');
                        continue;
                    }
                    _ => (),
                }
            }
            out.push(c);
            continue;
        }

        // Conversion specification: %[flags][width][.precision][length]conv
        let mut spec = String::from("%");
        let mut conv = None;
        while let Some(&c) = chars.peek() {
            chars.next();
            spec.push(c);
            match c {
                '-' | '+' | ' ' | '#' | '0'..='9' | '.' | 'l' | 'h' | 'z' => continue,
                _ => {
                    conv = Some(c);
                    break;
                }
            }
        }

        let arg = args[next_arg.min(3)];
        match conv {
            Some('%') => out.push('%'),
            Some('d') | Some('i') => {
                next_arg += 1;
                out.push_str(&pad(&spec, &(arg as i32).to_string()));
            }
            Some('u') => {
                next_arg += 1;
                out.push_str(&pad(&spec, &arg.to_string()));
            }
            Some('x') => {
                next_arg += 1;
                out.push_str(&pad(&spec, &format!("{:x}", arg)));
            }
            Some('X') => {
                next_arg += 1;
                out.push_str(&pad(&spec, &format!("{:X}", arg)));
            }
            Some('o') => {
                next_arg += 1;
                out.push_str(&pad(&spec, &format!("{:o}", arg)));
            }
            Some('c') => {
                next_arg += 1;
                out.push((arg & 0xFF) as u8 as char);
            }
            Some('f') => {
                next_arg += 1;
                // Bit cast of the little-endian 32-bit payload.
                let float = f32::from_bits(arg);
                out.push_str(&pad(&spec, &render_float(&spec, float)));
            }
            Some('s') => {
                // No string arguments exist in this protocol; emit the
                // value as text so the template stays recognisable.
                next_arg += 1;
                out.push_str(&arg.to_string());
            }
            _ => out.push_str(&spec),
        }
    }

    out
}

/// Applies the width/zero-pad/left-align parts of a conversion spec.
fn pad(spec: &str, rendered: &str) -> String {
    let body: String = spec
        .chars()
        .skip(1)
        .take_while(|c| !c.is_ascii_alphabetic())
        .collect();
    let left = body.contains('-');
    let zero = body.starts_with('0') && !left;
    let width: usize = body
        .trim_start_matches(|c| c == '-' || c == '+' || c == ' ' || c == '#' || c == '0')
        .split('.')
        .next()
        .unwrap_or("")
        .parse()
        .unwrap_or(0);

    if rendered.len() >= width {
        return rendered.to_string();
    }

    let fill = if zero { "0" } else { " " }.repeat(width - rendered.len());
    if left {
        format!("{}{}", rendered, fill)
    } else if zero && (rendered.starts_with('-') || rendered.starts_with('+')) {
        format!("{}{}{}", &rendered[..1], fill, &rendered[1..])
    } else {
        format!("{}{}", fill, rendered)
    }
}

/// Applies an explicit precision to a float conversion, default six
/// digits as printf has it.
fn render_float(spec: &str, value: f32) -> String {
    let precision = spec
        .split('.')
        .nth(1)
        .map(|rest| {
            rest.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .and_then(|digits| digits.parse::<usize>().ok())
        .unwrap_or(6);
    format!("{:.*}", precision, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("tick\n", 0, 4), "tick\n");
    }

    #[test]
    fn integer_conversions() {
        assert_eq!(render("v=%d", 42, 4), "v=42");
        assert_eq!(render("v=%08x", 0xBEEF, 4), "v=0000beef");
        assert_eq!(render("v=%u!", 7, 1), "v=7!");
        assert_eq!(render("%d,%d", 3, 4), "3,3");
    }

    #[test]
    fn negative_decimal() {
        assert_eq!(render("%d", (-5i32) as u32, 4), "-5");
    }

    #[test]
    fn char_template_renders_per_byte() {
        // 'H' 'i' '!' over a 3-byte payload, LSB first.
        let value = u32::from(b'H') | u32::from(b'i') << 8 | u32::from(b'!') << 16;
        assert_eq!(render("%c", value, 3), "Hi!");
        assert_eq!(render("<%c>", value, 2), "<H><i>");
    }

    #[test]
    fn float_template_bitcasts() {
        let value = 1.5f32.to_bits();
        assert_eq!(render("%f", value, 4), "1.500000");
        assert_eq!(render("%.2f", value, 4), "1.50");
    }

    #[test]
    fn escapes_and_literal_percent() {
        assert_eq!(render("a\\tb\\n", 0, 4), "a\tb\n");
        assert_eq!(render("100%%", 0, 4), "100%");
    }

    #[test]
    fn value_repeats_for_positional_args() {
        assert_eq!(render("%x %x %x %x", 0xAB, 4), "ab ab ab ab");
    }
}
