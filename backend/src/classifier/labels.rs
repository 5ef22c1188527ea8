pub const NUM_CLASSES: usize = 43;

pub const UNKNOWN_LABEL: &str = "unknown";

const GTSRB_LABELS: [&str; NUM_CLASSES] = [
    "Speed limit (20km/h)",
    "Speed limit (30km/h)",
    "Speed limit (50km/h)",
    "Speed limit (60km/h)",
    "Speed limit (70km/h)",
    "Speed limit (80km/h)",
    "End of speed limit (80km/h)",
    "Speed limit (100km/h)",
    "Speed limit (120km/h)",
    "No passing",
    "No passing for vehicles over 3.5 metric tons",
    "Right-of-way at the next intersection",
    "Priority road",
    "Yield",
    "Stop",
    "No vehicles",
    "Vehicles over 3.5 metric tons prohibited",
    "No entry",
    "General caution",
    "Dangerous curve to the left",
    "Dangerous curve to the right",
    "Double curve",
    "Bumpy road",
    "Slippery road",
    "Road narrows on the right",
    "Road work",
    "Traffic signals",
    "Pedestrians",
    "Children crossing",
    "Bicycles crossing",
    "Beware of ice/snow",
    "Wild animals crossing",
    "End of all speed and passing limits",
    "Turn right ahead",
    "Turn left ahead",
    "Ahead only",
    "Go straight or right",
    "Go straight or left",
    "Keep right",
    "Keep left",
    "Roundabout mandatory",
    "End of no passing",
    "End of no passing by vehicles over 3.5 metric tons",
];

/// Immutable class id to label mapping, built once at startup and shared by
/// reference with the request handlers.
#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    /// The 43 German traffic-sign classes the model was trained on.
    pub fn traffic_signs() -> Self {
        Self {
            labels: GTSRB_LABELS.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn label(&self, class_id: usize) -> &str {
        self.labels
            .get(class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self::traffic_signs()
    }
}
