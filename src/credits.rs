use crate::models::{GenerateType, GenerationParams};

pub const RAPID_BASE_CREDITS: i64 = 10;
pub const RAPID_PBR_CREDITS: i64 = 5;
pub const PRO_MULTI_VIEW_CREDITS: i64 = 10;
pub const PRO_PBR_CREDITS: i64 = 10;
pub const PRO_FACE_COUNT_CREDITS: i64 = 10;

/// Tunable part of the price list. Only the basic family has no fixed cost model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditPricing {
    pub basic: i64,
}

fn pro_base_credits(generate_type: GenerateType) -> i64 {
    match generate_type {
        GenerateType::Normal => 20,
        GenerateType::LowPoly => 25,
        GenerateType::Geometry => 15,
        GenerateType::Sketch => 25,
    }
}

pub fn calculate_credits(params: &GenerationParams, pricing: &CreditPricing) -> i64 {
    match params {
        GenerationParams::Rapid(rapid) => {
            let mut credits = RAPID_BASE_CREDITS;
            if rapid.enable_pbr {
                credits += RAPID_PBR_CREDITS;
            }
            credits
        }
        GenerationParams::Basic(_) => pricing.basic.max(0),
        GenerationParams::Pro(pro) => {
            let mut credits = pro_base_credits(pro.generate_type);
            if !pro.multi_view_images.is_empty() {
                credits += PRO_MULTI_VIEW_CREDITS;
            }
            // Geometry output is untextured, so PBR is never billed for it.
            if pro.enable_pbr && pro.generate_type != GenerateType::Geometry {
                credits += PRO_PBR_CREDITS;
            }
            if pro.face_count.is_some() {
                credits += PRO_FACE_COUNT_CREDITS;
            }
            credits
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageInput, MultiViewImage, ProParams, StandardParams, ViewType};

    fn pro(generate_type: GenerateType) -> ProParams {
        ProParams {
            prompt: Some("lamp".to_string()),
            generate_type,
            ..ProParams::default()
        }
    }

    #[test]
    fn rapid_is_flat_plus_pbr_surcharge() {
        let pricing = CreditPricing::default();
        let plain = GenerationParams::Rapid(StandardParams::default());
        assert_eq!(calculate_credits(&plain, &pricing), 10);

        let pbr = GenerationParams::Rapid(StandardParams {
            enable_pbr: true,
            ..StandardParams::default()
        });
        assert_eq!(calculate_credits(&pbr, &pricing), 15);
    }

    #[test]
    fn pro_base_cost_depends_on_style() {
        let pricing = CreditPricing::default();
        let cost = |t| calculate_credits(&GenerationParams::Pro(pro(t)), &pricing);
        assert_eq!(cost(GenerateType::Normal), 20);
        assert_eq!(cost(GenerateType::LowPoly), 25);
        assert_eq!(cost(GenerateType::Geometry), 15);
        assert_eq!(cost(GenerateType::Sketch), 25);
    }

    #[test]
    fn pro_surcharges_stack() {
        let pricing = CreditPricing::default();
        let mut params = pro(GenerateType::Normal);
        params.enable_pbr = true;
        params.face_count = Some(200_000);
        params.multi_view_images = vec![MultiViewImage {
            view_type: ViewType::Left,
            image: ImageInput::Url("https://cdn.example/left.png".to_string()),
        }];
        assert_eq!(calculate_credits(&GenerationParams::Pro(params), &pricing), 50);
    }

    #[test]
    fn geometry_style_is_never_charged_for_pbr() {
        let pricing = CreditPricing::default();
        let mut params = pro(GenerateType::Geometry);
        params.enable_pbr = true;
        assert_eq!(calculate_credits(&GenerationParams::Pro(params), &pricing), 15);
    }

    #[test]
    fn basic_cost_is_configurable() {
        let params = GenerationParams::Basic(StandardParams::default());
        assert_eq!(calculate_credits(&params, &CreditPricing::default()), 0);
        assert_eq!(calculate_credits(&params, &CreditPricing { basic: 12 }), 12);
    }
}
