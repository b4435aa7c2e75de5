use crate::errors::Error;
use crate::verifier::VerificationType;

/// Parsed method descriptor: argument types in declaration order, and the
/// return type (`None` for `void`).
///
/// Types come back in verification form, so all the integral primitives
/// collapse to `Integer` and arrays become object types named by their full
/// descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub arguments: Vec<VerificationType>,
    pub ret: Option<VerificationType>,
}

/// Parse a method descriptor like `(ILjava/lang/String;)V`
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.3.3
pub fn parse_method_descriptor(descriptor: &str) -> Result<MethodDescriptor, Error> {
    let bad = || Error::BadDescriptor(descriptor.to_owned());
    let mut chars = descriptor.char_indices().peekable();
    match chars.next() {
        Some((_, '(')) => (),
        _ => return Err(bad()),
    }

    let mut arguments = Vec::new();
    loop {
        match chars.peek() {
            Some((_, ')')) => {
                chars.next();
                break;
            }
            Some(_) => arguments.push(parse_type(descriptor, &mut chars)?),
            None => return Err(bad()),
        }
    }

    let ret = match chars.peek() {
        Some((_, 'V')) => {
            chars.next();
            None
        }
        Some(_) => Some(parse_type(descriptor, &mut chars)?),
        None => return Err(bad()),
    };

    if chars.next().is_some() {
        return Err(bad());
    }
    Ok(MethodDescriptor { arguments, ret })
}

/// Parse a field descriptor like `[Ljava/io/PrintStream;`
pub fn parse_field_descriptor(descriptor: &str) -> Result<VerificationType, Error> {
    let mut chars = descriptor.char_indices().peekable();
    let parsed = parse_type(descriptor, &mut chars)?;
    if chars.next().is_some() {
        return Err(Error::BadDescriptor(descriptor.to_owned()));
    }
    Ok(parsed)
}

fn parse_type(
    descriptor: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
) -> Result<VerificationType, Error> {
    let bad = || Error::BadDescriptor(descriptor.to_owned());
    let (start, c) = chars.next().ok_or_else(bad)?;
    match c {
        'B' | 'C' | 'I' | 'S' | 'Z' => Ok(VerificationType::Integer),
        'F' => Ok(VerificationType::Float),
        'J' => Ok(VerificationType::Long),
        'D' => Ok(VerificationType::Double),
        'L' => {
            for (idx, c) in chars.by_ref() {
                if c == ';' {
                    return Ok(VerificationType::Object(
                        descriptor[start + 1..idx].to_owned(),
                    ));
                }
            }
            Err(bad())
        }
        // arrays keep their whole descriptor as the class name
        '[' => {
            parse_type(descriptor, chars)?;
            let end = match chars.peek() {
                Some((idx, _)) => *idx,
                None => descriptor.len(),
            };
            Ok(VerificationType::Object(descriptor[start..end].to_owned()))
        }
        _ => Err(bad()),
    }
}
