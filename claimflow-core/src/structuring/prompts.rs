//! Instruction templates for the structuring agent.

use super::{SchemaProfile, VehicleSide};

const FRONT_FIELDS: &str = r#"
  "vehicle_side": "front",
  "front_specific": {
    "windshield_damage": "intact | cracked | shattered | null",
    "front_bumper_damage": "none | scratched | dented | detached | null",
    "headlights_damage": "intact | cracked | broken | missing | null",
    "hood_damage": "none | scratched | dented | buckled | null",
    "grille_damage": "intact | damaged | missing | null",
    "license_plate_visible": true or false,
    "front_damage_severity": "none | minor | moderate | severe"
  },"#;

const FRONT_REQUIREMENTS: &str = "
**FRONT PHOTO REQUIREMENTS**:
- MUST extract windshield condition (intact/cracked/shattered)
- MUST assess front bumper damage level
- MUST check headlight condition (both left and right if visible)
- MUST evaluate hood damage
- MUST note if license plate is visible and readable
- MUST provide overall front damage severity rating";

const BACK_FIELDS: &str = r#"
  "vehicle_side": "back",
  "back_specific": {
    "rear_windshield_damage": "intact | cracked | shattered | null",
    "rear_bumper_damage": "none | scratched | dented | detached | null",
    "taillights_damage": "intact | cracked | broken | missing | null",
    "trunk_damage": "none | scratched | dented | buckled | null",
    "exhaust_damage": "intact | damaged | detached | null",
    "license_plate_visible": true or false,
    "rear_damage_severity": "none | minor | moderate | severe"
  },"#;

const BACK_REQUIREMENTS: &str = "
**BACK PHOTO REQUIREMENTS**:
- MUST extract rear windshield condition (intact/cracked/shattered)
- MUST assess rear bumper damage level
- MUST check taillight condition (both left and right if visible)
- MUST evaluate trunk/hatchback damage
- MUST note if rear license plate is visible and readable
- MUST provide overall rear damage severity rating";

const GENERAL_FIELDS: &str = r#"
  "vehicle_side": "unspecified","#;

const GENERAL_REQUIREMENTS: &str = "
**GENERAL PHOTO**:
- Extract any visible damage information
- Note which parts of vehicle are visible in the image";

const DETAILED_HEADER: &str = "You are an expert document structuring assistant specialized in converting OCR text from insurance claims documents into structured JSON format.

**Your Task**:
Extract and structure information from OCR text into a standardized JSON format for insurance claims processing.

**JSON Output Structure**:
{
  \"document_type\": \"claim_form | damage_photo | policy_document | statement\",";

const DETAILED_BODY: &str = r#"
  "extracted_data": {
    "policy_holder": {
      "name": "extracted name or null",
      "policy_number": "extracted policy number or null"
    },
    "incident": {
      "date": "YYYY-MM-DD or null",
      "type": "vehicle_collision | theft | vandalism | weather | fire | other",
      "description": "brief description or null",
      "location": "location if mentioned or null"
    },
    "damages": {
      "description": "damage description",
      "estimated_amount": numeric_amount or null,
      "currency": "USD or other",
      "items": [
        {
          "part": "part name",
          "cost": numeric_cost or null
        }
      ]
    },
    "vehicle_info": {
      "make": "manufacturer or null",
      "model": "model or null",
      "year": numeric_year or null,
      "license_plate": "plate number or null",
      "vin": "VIN if present or null"
    },
    "contact_info": {
      "phone": "phone number or null",
      "email": "email or null",
      "address": "address or null"
    },
    "additional_details": "any other relevant information"
  },
  "confidence": "high | medium | low",
  "extraction_notes": "notes about the extraction quality or missing information"
}"#;

const DETAILED_RULES: &str = "

**Processing Rules**:
1. Extract all available information from the OCR text
2. Use null for fields where information is not present
3. Preserve numeric values as numbers, not strings
4. Standardize dates to YYYY-MM-DD format when possible
5. Classify document type based on content
6. Set confidence level based on text clarity and completeness
7. Include extraction notes about any ambiguities or issues
8. For damage photos with minimal text, focus on visible damage descriptions
9. Return ONLY valid JSON, no additional commentary

**Important**: Your entire response must be valid JSON that can be parsed. Do not include any text before or after the JSON object.";

const SUMMARY_INSTRUCTIONS: &str = "You are a JSON structuring agent specialized in insurance claims data.

Your task:
1. Receive OCR text from claim documents
2. Structure the text into valid JSON format with these fields:
   - vehicle_info: {make, model, color, year}
   - damage_assessment: {severity, affected_areas[], estimated_cost}
   - incident_info: {date, location, description}
3. Return ONLY valid JSON, no markdown or explanations

Always return properly formatted JSON.";

/// System instructions for a profile. `side` only affects [`SchemaProfile::Detailed`].
pub fn instructions(profile: SchemaProfile, side: VehicleSide) -> String {
    match profile {
        SchemaProfile::Summary => SUMMARY_INSTRUCTIONS.to_string(),
        SchemaProfile::Detailed => {
            let (fields, requirements) = match side {
                VehicleSide::Front => (FRONT_FIELDS, FRONT_REQUIREMENTS),
                VehicleSide::Back => (BACK_FIELDS, BACK_REQUIREMENTS),
                VehicleSide::Unspecified => (GENERAL_FIELDS, GENERAL_REQUIREMENTS),
            };
            format!("{DETAILED_HEADER}{fields}{DETAILED_BODY}{requirements}{DETAILED_RULES}")
        }
    }
}

/// The user turn carrying the OCR text.
pub fn user_query(ocr_text: &str, side: VehicleSide) -> String {
    let side_context = match side {
        VehicleSide::Front => " This is a FRONT view of the vehicle.",
        VehicleSide::Back => " This is a BACK view of the vehicle.",
        VehicleSide::Unspecified => "",
    };
    format!(
        "Please structure the following OCR text into the standardized JSON format.{side_context}\n\n\
         ---OCR TEXT START---\n{ocr_text}\n---OCR TEXT END---\n\n\
         Return only the structured JSON object."
    )
}
