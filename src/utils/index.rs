/// Shortens an address for display, keeping the `0x` prefix plus `width` leading and
/// trailing characters.
pub fn ellipse_address(address: &str, width: usize) -> String {
	let chars: Vec<char> = address.chars().collect();
	if chars.len() <= width * 2 + 2 {
		return address.to_string();
	}

	let head: String = chars[..width + 2].iter().collect();
	let tail: String = chars[chars.len() - width..].iter().collect();
	format!("{}...{}", head, tail)
}
