use std::str::FromStr;

/// Scan the raw argument list for a `--flag value` pair and return the value
/// token, if any. Flag names match case-insensitively; a flag at the end of
/// the list has no value.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut tokens = args.iter();
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case(flag) {
            return tokens.next().map(String::as_str);
        }
    }
    None
}

/// Typed lookup: an absent flag is `None`, an unparsable value is the parse
/// error of the target type.
pub fn parse_flag<T: FromStr>(args: &[String], flag: &str) -> Result<Option<T>, T::Err> {
    flag_value(args, flag).map(str::parse).transpose()
}
