//! Instruction contract for the extraction and summary calls.

pub const EXTRACTION_SYSTEM: &str =
    "You are a precise data extraction system. Return only valid JSON, no explanations.";

pub const SUMMARY_SYSTEM: &str =
    "You are a professional summarizer. Create brief, clear summaries.";

/// Characters of raw text sent to the summary call
pub const SUMMARY_INPUT_CHARS: usize = 3000;

const EXTRACTION_INSTRUCTIONS: &str = r##"You are extracting the SENDER's details from a letter written by an incarcerated person to someone outside the facility.

The OCR text below is split into pages marked "--- PAGE n ---". Sender details usually appear in three places: the envelope (page 1, printed and most reliable), the letter body ("my name is ...") and the signature (handwritten, least reliable). Cross-reference all three. When they disagree prefer envelope, then body, then signature.

Fields:
- firstName, middleName, lastName: the sender's name. middleName is null when absent.
- docNumber: the inmate identifier VALUE, never its label. "CDCR# BK8702" gives "BK8702", "IDOC #101241" gives "101241", "Register Number 180738" gives "180738". Keep letter prefixes. The value never contains ":", "#" or spaces. If the envelope is incomplete, look for a standalone code at the top of later pages.
- facilityName: the full name of the facility.
- address: the facility's mailing address, normally a P.O. Box. Never use the recipient's street address.
- unit: the building, bed or unit code, e.g. "Bldg/Bed: B4-217" gives "B4-217". null when absent.

Watch for common OCR confusions (I/F, B/3, z/ng) and prefer the reading that matches the printed envelope.

Return ONLY this JSON:
{
    "firstName": "string",
    "middleName": "string or null",
    "lastName": "string",
    "docNumber": "string",
    "facilityName": "string",
    "address": "string",
    "unit": "string or null"
}"##;

pub fn extraction_prompt(raw_text: &str) -> String {
    format!("{EXTRACTION_INSTRUCTIONS}\n\nOCR Text:\n{raw_text}\n\nJSON Response:")
}

pub fn summary_prompt(raw_text: &str) -> String {
    let excerpt: String = raw_text.chars().take(SUMMARY_INPUT_CHARS).collect();
    format!(
        "Summarize this letter in 1-2 sentences. Focus on the main message, request, or purpose of the letter.\n\nLetter content:\n{excerpt}\n\nSummary (1-2 sentences):"
    )
}
