use bimm_cvt::models::cvt::{Cvt, CvtConfig, CvtMeta};
use burn::backend::NdArray;
use burn::module::Module;
use burn::prelude::Tensor;

#[test]
fn default_config_on_224_image() {
    let device = Default::default();
    let model: Cvt<NdArray> = CvtConfig::new(3).init(&device);

    assert_eq!(model.d_output(), 384);
    assert_eq!(model.stage_resolutions(224), Ok(vec![56, 28, 14]));
    assert!(model.num_params() > 0);

    let images = Tensor::<NdArray, 4>::ones([1, 3, 224, 224], &device);
    let tokens = model.apply_stages(images.clone());
    // 14 * 14 + 1
    assert_eq!(tokens.dims(), [1, 197, 384]);

    let output = model.forward(images);
    assert_eq!(output.dims(), [1, 384]);
}
